use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::engine::rpc::EngineMessage;

/// Maximum frame payload size: 1 MB.
const MAX_FRAME_SIZE: usize = 1_048_576;

/// Length-prefixed JSON frame codec for the engine control channel.
pub struct EngineCodec {
    inner: LengthDelimitedCodec,
}

impl Default for EngineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineCodec {
    pub fn new() -> Self {
        let inner = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(4)
            .max_frame_length(MAX_FRAME_SIZE)
            .length_adjustment(0)
            .new_codec();

        Self { inner }
    }
}

impl Encoder<EngineMessage> for EngineCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: EngineMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item).context("failed to serialize engine message")?;
        self.inner
            .encode(Bytes::from(json), dst)
            .map_err(|e| anyhow::anyhow!(e))
    }
}

impl Decoder for EngineCodec {
    type Item = EngineMessage;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src).map_err(|e| anyhow::anyhow!(e))? {
            Some(bytes) => {
                let msg =
                    serde_json::from_slice(&bytes).context("failed to deserialize engine message")?;
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }
}
