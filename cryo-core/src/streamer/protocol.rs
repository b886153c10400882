//! Control protocol of the image streamer.
//!
//! Requests and replies are protobuf messages framed by a 4-byte
//! little-endian length.

use std::io::{self, Read, Write};

use prost::Message;

/// Sent as a file name to make the streamer stop accepting requests.
pub const STOP_LISTENER: &str = "stop-listener";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ImgStreamerRequestEntry {
    #[prost(string, required, tag = "1")]
    pub filename: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ImgStreamerReplyEntry {
    #[prost(bool, required, tag = "1")]
    pub exists: bool,
}

fn frame<M: Message>(message: &M) -> Vec<u8> {
    let body = message.encode_to_vec();
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);
    buf
}

fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let mut body = vec![0u8; u32::from_le_bytes(len) as usize];
    reader.read_exact(&mut body)?;
    Ok(body)
}

/// Asks for `filename`. Header and body go out in one write.
pub fn write_request<W: Write>(writer: &mut W, filename: &str) -> io::Result<()> {
    let request = ImgStreamerRequestEntry {
        filename: filename.to_string(),
    };
    writer.write_all(&frame(&request))?;
    writer.flush()
}

pub fn read_request<R: Read>(reader: &mut R) -> io::Result<ImgStreamerRequestEntry> {
    let body = read_frame(reader)?;
    ImgStreamerRequestEntry::decode(body.as_slice())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub fn write_reply<W: Write>(writer: &mut W, exists: bool) -> io::Result<()> {
    writer.write_all(&frame(&ImgStreamerReplyEntry { exists }))?;
    writer.flush()
}

pub fn read_reply<R: Read>(reader: &mut R) -> io::Result<ImgStreamerReplyEntry> {
    let body = read_frame(reader)?;
    ImgStreamerReplyEntry::decode(body.as_slice())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
