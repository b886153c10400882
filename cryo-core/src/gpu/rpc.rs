//! GPU controller wire protocol.
//!
//! One request and one response per connection, each framed as a 4-byte
//! big-endian length followed by the encoded message.

use std::io;

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame either side accepts.
pub const MAX_FRAME: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum GpuCall {
    HealthCheck = 0,
    Dump = 1,
    Restore = 2,
}

impl GpuCall {
    pub fn name(&self) -> &'static str {
        match self {
            GpuCall::HealthCheck => "health check",
            GpuCall::Dump => "dump",
            GpuCall::Restore => "restore",
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GpuRequest {
    #[prost(enumeration = "GpuCall", tag = "1")]
    pub call: i32,
    /// Image directory for dump and restore.
    #[prost(string, tag = "2")]
    pub dir: ::prost::alloc::string::String,
    #[prost(bool, tag = "3")]
    pub stream: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthCheckResp {
    #[prost(int32, tag = "1")]
    pub device_count: i32,
    #[prost(string, tag = "2")]
    pub version: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub driver_version: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GpuResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub error: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "3")]
    pub health: ::core::option::Option<HealthCheckResp>,
}

impl GpuRequest {
    pub fn health_check() -> Self {
        Self {
            call: GpuCall::HealthCheck as i32,
            ..Default::default()
        }
    }

    pub fn dump(dir: impl Into<String>, stream: bool) -> Self {
        Self {
            call: GpuCall::Dump as i32,
            dir: dir.into(),
            stream,
        }
    }

    pub fn restore(dir: impl Into<String>, stream: bool) -> Self {
        Self {
            call: GpuCall::Restore as i32,
            dir: dir.into(),
            stream,
        }
    }
}

pub async fn write_frame<W, M>(writer: &mut W, msg: &M) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    M: Message,
{
    let body = msg.encode_to_vec();
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    writer.write_all(&frame).await?;
    writer.flush().await
}

pub async fn read_frame<R, M>(reader: &mut R) -> io::Result<M>
where
    R: AsyncRead + Unpin,
    M: Message + Default,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    M::decode(body.as_slice()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_is_big_endian_length_prefixed() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &GpuRequest::dump("/tmp/d", true))
            .await
            .unwrap();
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);

        let req: GpuRequest = read_frame(&mut buf.as_slice()).await.unwrap();
        assert_eq!(req.call(), GpuCall::Dump);
        assert_eq!(req.dir, "/tmp/d");
        assert!(req.stream);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let frame = ((MAX_FRAME + 1) as u32).to_be_bytes();
        let err = read_frame::<_, GpuResponse>(&mut frame.as_slice())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
