use std::io;

use async_trait::async_trait;

use super::{BoxStream, PacketConn, Proxy};
use crate::metadata::Metadata;

/// Refuses every dial.
#[derive(Debug, Default, Clone, Copy)]
pub struct Reject;

impl Reject {
    pub const NAME: &'static str = "REJECT";
}

fn refused(metadata: &Metadata) -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionRefused,
        format!("{} rejected by rule", metadata.remote_address()),
    )
}

#[async_trait]
impl Proxy for Reject {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn support_udp(&self) -> bool {
        true
    }

    async fn dial(&self, metadata: &Metadata) -> io::Result<BoxStream> {
        Err(refused(metadata))
    }

    async fn dial_udp(&self, metadata: &Metadata) -> io::Result<Box<dyn PacketConn>> {
        Err(refused(metadata))
    }
}
