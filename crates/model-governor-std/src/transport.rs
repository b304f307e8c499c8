// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Length-prefixed frame codec shared by the server and the client.
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! JSON.  [`FrameCodec`] plugs into [`tokio_util::codec::Framed`], so both
//! ends read with `StreamExt::next` and write with `SinkExt::send`.
//!
//! A header announcing more than [`MAX_FRAME_SIZE`] bytes does not poison the
//! stream.  The decoder yields [`Frame::Oversized`] and silently drops the
//! announced payload as it arrives, so the peer can be told what went wrong
//! and the next frame is read normally.  Only headers beyond
//! [`MAX_DISCARD_SIZE`] are treated as a broken stream.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use model_governor_core::error::ProtocolError;
use model_governor_core::protocol::{check_frame_len, FRAME_HEADER_LEN, MAX_FRAME_SIZE};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};

/// Largest announced payload the decoder will skip over instead of failing.
pub const MAX_DISCARD_SIZE: usize = 16 * MAX_FRAME_SIZE;

/// Failures while moving frames across a stream.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The peer closed the stream part-way through a frame.
    #[error("connection closed mid-frame")]
    UnexpectedEof,
}

/// One decoded unit from the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete payload.
    Message(Bytes),
    /// A header announced `len` bytes, above [`MAX_FRAME_SIZE`].  The payload
    /// is being discarded.
    Oversized { len: usize },
}

/// Codec for 4-byte big-endian length-prefixed frames.
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Payload bytes of an oversized frame still to be dropped.
    discarding: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn discard_buffered(&mut self, src: &mut BytesMut) {
        let skip = self.discarding.min(src.len());
        src.advance(skip);
        self.discarding -= skip;
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        if self.discarding > 0 {
            self.discard_buffered(src);
            if self.discarding > 0 {
                return Ok(None);
            }
        }

        let Some(header) = src.get(..FRAME_HEADER_LEN) else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;

        if len > MAX_FRAME_SIZE {
            if len > MAX_DISCARD_SIZE {
                return Err(ProtocolError::FrameTooLarge { size: len, max: MAX_FRAME_SIZE }.into());
            }
            src.advance(FRAME_HEADER_LEN);
            self.discarding = len;
            self.discard_buffered(src);
            return Ok(Some(Frame::Oversized { len }));
        }

        let end = FRAME_HEADER_LEN + len;
        if src.len() < end {
            src.reserve(end - src.len());
            return Ok(None);
        }
        src.advance(FRAME_HEADER_LEN);
        Ok(Some(Frame::Message(src.split_to(len).freeze())))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && self.discarding == 0 => Ok(None),
            None => Err(TransportError::UnexpectedEof),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), TransportError> {
        check_frame_len(payload.len())?;
        // Bounded by MAX_FRAME_SIZE above, so the cast cannot truncate.
        let len = payload.len() as u32;
        dst.reserve(FRAME_HEADER_LEN + payload.len());
        dst.put_u32(len);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

/// Serialise `value` and send it as one frame.
pub async fn send_json<S, T>(framed: &mut Framed<S, FrameCodec>, value: &T) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value).map_err(ProtocolError::from)?;
    framed.send(Bytes::from(body)).await
}

/// Receive one frame and deserialise it.  `Ok(None)` means the peer closed
/// the stream cleanly between frames.
pub async fn recv_json<S, T>(framed: &mut Framed<S, FrameCodec>) -> Result<Option<T>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: DeserializeOwned,
{
    match framed.next().await {
        None => Ok(None),
        Some(Ok(Frame::Message(payload))) => Ok(Some(serde_json::from_slice(&payload).map_err(ProtocolError::from)?)),
        Some(Ok(Frame::Oversized { len })) => Err(ProtocolError::FrameTooLarge { size: len, max: MAX_FRAME_SIZE }.into()),
        Some(Err(error)) => Err(error),
    }
}
