use crate::chord::command::Command;
use crate::chord::types::Digest;
use crate::error::MessageError;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

const FRAMES_PER_ENVELOPE: usize = 3;

/// A command addressed to one physical node.
///
/// On the wire this is three length-delimited frames: the destination's
/// owner digest (4 bytes, big-endian), the command tag and the JSON payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub identity: Digest,
    pub command: Command,
}

impl Envelope {
    pub fn new(identity: Digest, command: Command) -> Self {
        Self { identity, command }
    }
}

#[derive(Debug, Default)]
pub struct EnvelopeCodec {
    frames: LengthDelimitedCodec,
    partial: Vec<BytesMut>,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

fn parse_identity(frame: &[u8]) -> Result<Digest, MessageError> {
    let bytes: [u8; 4] = frame.try_into().map_err(|_| {
        MessageError::InvalidFormat(format!("identity frame has {} bytes, want 4", frame.len()))
    })?;
    Digest::try_from(u32::from_be_bytes(bytes))
        .map_err(|e| MessageError::InvalidFormat(e.to_string()))
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = MessageError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, MessageError> {
        while self.partial.len() < FRAMES_PER_ENVELOPE {
            match self.frames.decode(src)? {
                Some(frame) => self.partial.push(frame),
                None => return Ok(None),
            }
        }

        let mut frames = std::mem::take(&mut self.partial).into_iter();
        let (Some(identity), Some(tag), Some(payload)) = (frames.next(), frames.next(), frames.next())
        else {
            return Err(MessageError::InvalidFormat("incomplete envelope".into()));
        };

        let identity = parse_identity(&identity)?;
        let tag = std::str::from_utf8(&tag)
            .map_err(|e| MessageError::InvalidFormat(format!("tag is not UTF-8: {}", e)))?;
        let command = Command::decode(tag, &payload)?;
        Ok(Some(Envelope { identity, command }))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = MessageError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), MessageError> {
        let payload = item.command.encode_payload()?;
        let identity = Bytes::copy_from_slice(&item.identity.value().to_be_bytes());
        self.frames.encode(identity, dst)?;
        self.frames.encode(Bytes::from_static(item.command.tag().as_bytes()), dst)?;
        self.frames.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}
