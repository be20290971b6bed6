//! `tokio_util` codec framing VRCL elements for async peers.
//!
//! Uses the same scanner as the server's receive buffer, so framing is
//! identical on both ends regardless of how TCP segments the stream.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::error::VpError;

use super::buffer::DEFAULT_CAPACITY;
use super::scanner::{Scan, scan};
use super::xml::XmlElement;

#[derive(Debug)]
pub struct VrclCodec {
    max_frame: usize,
}

impl VrclCodec {
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_CAPACITY)
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Default for VrclCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for VrclCodec {
    type Item = XmlElement;
    type Error = VpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match scan(src) {
                Scan::Complete { unit, len } => {
                    src.advance(len);
                    match XmlElement::parse(&unit.raw) {
                        Ok(element) => return Ok(Some(element)),
                        Err(e) => warn!(tag = %unit.name, "dropping unparsable message: {e}"),
                    }
                }
                Scan::Skip(n) => src.advance(n),
                Scan::Invalid { skip } => {
                    debug!(
                        raw = %String::from_utf8_lossy(&src[..skip]),
                        "skipping invalid markup"
                    );
                    src.advance(skip);
                }
                Scan::Incomplete => {
                    if src.len() > self.max_frame {
                        return Err(VpError::ProtocolViolation("frame size exceeded"));
                    }
                    return Ok(None);
                }
            }
        }
    }
}

impl Encoder<XmlElement> for VrclCodec {
    type Error = VpError;

    fn encode(&mut self, item: XmlElement, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item.to_xml().as_bytes());
        Ok(())
    }
}
