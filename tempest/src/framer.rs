//! Frame construction and the incremental header parser.
//!
//! Wire layout of a frame:
//!
//! ```text
//! [protocol_id:u8][connection_id:i32][message_type:u16]
//! [(length << 1) | has_type_table : i32]
//! [message_id | response_flag : i32]
//! [type table?  : u16 table_len, u16 count, (u32-len string) x N]
//! [payload]
//! [signature?   : i32 len, HMAC-SHA256 or RSA signature]
//! ```
//!
//! Encrypted frames replace everything after the length field with
//! `u32 ciphertext_len, iv[16], ciphertext`; the message-id word, type
//! table and payload are recovered by decryption. The declared length
//! always equals the total frame size, so a receiver can locate frame
//! boundaries without understanding the payload.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use tempest_proto::constants::{BASE_HEADER_LEN, IV_LEN, LENGTH_FIELD_OFFSET};
use tempest_proto::{
    BufferReader, BufferWriter, DeserializationContext, SerializationContext, TypeRegistry,
};

use crate::crypto::{AuthKey, SessionCrypto, SigningHash};
use crate::error::{ConnectionResult, Error, Result};
use crate::message::{ConnectionId, Message, MessageHeader, MessageId};
use crate::protocol::ProtocolRegistry;

/// Offset of the message-id word; the encrypted segment starts here.
const MESSAGE_ID_OFFSET: usize = LENGTH_FIELD_OFFSET + 4;

/// Outcome of advancing the header parser.
#[derive(Debug)]
pub enum HeaderPoll {
    /// The remaining bytes cannot advance the header state.
    NeedMore,
    /// The header is complete; take it from the state.
    Complete,
    /// The frame is unparseable; disconnect with the given reason.
    Invalid(ConnectionResult),
}

/// Parse stages, advanced strictly in order. Fields committed by an
/// earlier stage are never re-parsed when more bytes arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Protocol,
    ConnectionId,
    Type,
    Length,
    Iv,
    MessageId,
    TypeMap,
    Complete,
}

/// Incremental state for one in-flight header. A connection keeps one
/// of these per frame and feeds it the unread window until it reports
/// [`HeaderPoll::Complete`].
#[derive(Debug)]
pub struct HeaderState {
    stage: Stage,
    /// Wire bytes committed so far, from the start of the frame.
    consumed: usize,
    header: MessageHeader,
    message: Option<Box<dyn Message>>,
    /// Decrypted continuation and its cursor, for encrypted frames.
    plain: Option<Vec<u8>>,
    plain_pos: usize,
}

impl Default for HeaderState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderState {
    pub fn new() -> Self {
        HeaderState {
            stage: Stage::Protocol,
            consumed: 0,
            header: MessageHeader::default(),
            plain: None,
            plain_pos: 0,
            message: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.stage == Stage::Complete
    }

    /// Total wire bytes this frame occupies, once the length field has
    /// been committed.
    pub fn frame_len(&self) -> Option<usize> {
        if matches!(self.stage, Stage::Protocol | Stage::ConnectionId | Stage::Type | Stage::Length)
        {
            None
        } else {
            Some(self.header.message_len)
        }
    }

    /// Takes the finished header and message instance.
    pub fn finish(mut self) -> (MessageHeader, Box<dyn Message>) {
        debug_assert_eq!(self.stage, Stage::Complete);
        self.header.decrypted = self.plain.take();
        let message = self.message.take().expect("complete header has a message");
        (self.header, message)
    }
}

/// Builds outbound frames and parses inbound headers for a connection.
///
/// The session crypto handle is shared with the peer path of the same
/// connection; it is `None` until the handshake installs it.
pub struct Framer {
    registry: Arc<ProtocolRegistry>,
    types: Arc<TypeRegistry>,
    crypto: Option<Arc<Mutex<SessionCrypto>>>,
    max_message_size: usize,
}

impl Framer {
    pub fn new(
        registry: Arc<ProtocolRegistry>,
        types: Arc<TypeRegistry>,
        max_message_size: usize,
    ) -> Self {
        Framer {
            registry,
            types,
            crypto: None,
            max_message_size,
        }
    }

    pub fn registry(&self) -> &Arc<ProtocolRegistry> {
        &self.registry
    }

    pub fn type_registry(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    /// Installs the negotiated session key. Subsequent frames with the
    /// `encrypted` or `authenticated` flags use it.
    pub fn install_crypto(&mut self, crypto: Arc<Mutex<SessionCrypto>>) {
        self.crypto = Some(crypto);
    }

    pub fn crypto(&self) -> Option<&Arc<Mutex<SessionCrypto>>> {
        self.crypto.as_ref()
    }

    pub fn has_crypto(&self) -> bool {
        self.crypto.is_some()
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Frames a message for the wire, applying the encryption or
    /// signing envelope its flags require.
    pub fn frame(
        &self,
        message: &dyn Message,
        connection_id: ConnectionId,
        message_id: MessageId,
        is_response: bool,
    ) -> Result<Vec<u8>> {
        let flags = message.flags();
        let (mut w, has_table) = self.frame_open(message, connection_id, message_id, is_response)?;

        if flags.encrypted {
            let crypto = self.crypto.as_ref().ok_or(Error::NoSessionKey)?;
            Self::seal(&mut w, &mut crypto.lock());
        } else if flags.authenticated {
            // The signature covers the frame with the length field
            // still zeroed; verification recreates that view.
            let crypto = self.crypto.as_ref().ok_or(Error::NoSessionKey)?;
            let tag = crypto.lock().sign(w.as_slice());
            w.write_bytes(&tag);
        }

        self.frame_close(w, has_table)
    }

    /// Frames a message and signs it with an asymmetric key instead of
    /// the session HMAC. Used for the handshake's final step, which is
    /// signed before any session key exists.
    pub fn frame_with_key(
        &self,
        message: &dyn Message,
        connection_id: ConnectionId,
        message_id: MessageId,
        key: &dyn AuthKey,
        hash: SigningHash,
    ) -> Result<Vec<u8>> {
        let (mut w, has_table) = self.frame_open(message, connection_id, message_id, false)?;
        let signature = key.sign(hash, w.as_slice())?;
        w.write_bytes(&signature);
        self.frame_close(w, has_table)
    }

    /// Writes the header and payload with the length field still
    /// zeroed, leaving the buffer ready for an envelope pass.
    fn frame_open(
        &self,
        message: &dyn Message,
        connection_id: ConnectionId,
        message_id: MessageId,
        is_response: bool,
    ) -> Result<(BufferWriter, bool)> {
        let mut ctx = SerializationContext::new();
        let mut payload = BufferWriter::new();
        message.write_payload(&mut ctx, &mut payload)?;

        let mut w = BufferWriter::with_capacity(BASE_HEADER_LEN + payload.len() + 64);
        w.write_u8(message.protocol_id());
        w.write_i32(connection_id.0);
        w.write_u16(message.message_type());
        w.write_i32(0); // length and type-table flag, patched in frame_close
        w.write_i32(MessageHeader::pack_message_id(message_id, is_response));

        let fresh = ctx.types.drain_new();
        if !fresh.is_empty() {
            let mut table = BufferWriter::new();
            table.write_u16(fresh.len() as u16);
            for (name, _id) in &fresh {
                table.write_u32(name.len() as u32);
                table.write_raw(name.as_bytes());
            }
            w.write_u16((table.len() + 2) as u16);
            w.write_raw(table.as_slice());
        }
        w.write_raw(payload.as_slice());
        Ok((w, !fresh.is_empty()))
    }

    /// Patches the final length and type-table flag into the length
    /// field and checks the configured size cap.
    fn frame_close(&self, mut w: BufferWriter, has_table: bool) -> Result<Vec<u8>> {
        let total = w.len();
        if total > self.max_message_size {
            return Err(Error::MessageTooLarge {
                size: total,
                max: self.max_message_size,
            });
        }
        w.set_position(LENGTH_FIELD_OFFSET);
        w.write_i32(((total as i32) << 1) | i32::from(has_table));
        Ok(w.into_vec())
    }

    /// Replaces everything after the length field with the encryption
    /// envelope: ciphertext length, spliced IV, ciphertext.
    fn seal(w: &mut BufferWriter, crypto: &mut SessionCrypto) {
        let (iv, ciphertext) = crypto.encrypt(&w.as_slice()[MESSAGE_ID_OFFSET..]);
        w.truncate(MESSAGE_ID_OFFSET);
        w.set_position(MESSAGE_ID_OFFSET);
        w.write_u32(ciphertext.len() as u32);
        w.write_raw(&ciphertext);
        w.insert_bytes(MESSAGE_ID_OFFSET + 4, &iv);
    }

    /// Advances the header parser over `window`, the unread bytes
    /// starting at the beginning of the current frame. Safe to call
    /// repeatedly with a growing window; committed fields are kept.
    pub fn try_read_header(&self, state: &mut HeaderState, window: &[u8]) -> HeaderPoll {
        loop {
            match state.stage {
                Stage::Protocol => {
                    let Some(bytes) = take::<1>(window, state) else {
                        return HeaderPoll::NeedMore;
                    };
                    state.header.protocol_id = bytes[0];
                    if !self.registry.contains_protocol(state.header.protocol_id) {
                        return HeaderPoll::Invalid(ConnectionResult::FailedUnknown);
                    }
                    state.stage = Stage::ConnectionId;
                }
                Stage::ConnectionId => {
                    let Some(bytes) = take::<4>(window, state) else {
                        return HeaderPoll::NeedMore;
                    };
                    state.header.connection_id = ConnectionId(i32::from_le_bytes(bytes));
                    state.stage = Stage::Type;
                }
                Stage::Type => {
                    let Some(bytes) = take::<2>(window, state) else {
                        return HeaderPoll::NeedMore;
                    };
                    state.header.message_type = u16::from_le_bytes(bytes);
                    let Some(message) = self
                        .registry
                        .create(state.header.protocol_id, state.header.message_type)
                    else {
                        trace!(
                            protocol = state.header.protocol_id,
                            message_type = state.header.message_type,
                            "no factory for inbound message type"
                        );
                        return HeaderPoll::Invalid(ConnectionResult::FailedUnknown);
                    };
                    state.header.flags = message.flags();
                    state.message = Some(message);
                    state.stage = Stage::Length;
                }
                Stage::Length => {
                    let Some(bytes) = take::<4>(window, state) else {
                        return HeaderPoll::NeedMore;
                    };
                    let word = i32::from_le_bytes(bytes);
                    let length = word >> 1;
                    if length <= 0 {
                        return HeaderPoll::Invalid(ConnectionResult::FailedUnknown);
                    }
                    if length as usize > self.max_message_size {
                        return HeaderPoll::Invalid(ConnectionResult::FailedUnknown);
                    }
                    state.header.message_len = length as usize;
                    state.header.has_type_table = word & 1 != 0;
                    if state.header.flags.encrypted {
                        if self.crypto.is_none() {
                            return HeaderPoll::Invalid(ConnectionResult::EncryptionMismatch);
                        }
                        state.stage = Stage::Iv;
                    } else {
                        state.stage = Stage::MessageId;
                    }
                }
                Stage::Iv => {
                    // The whole envelope must be present before we can
                    // decrypt: u32 length, 16-byte IV, ciphertext.
                    if window.len() < state.consumed + 4 + IV_LEN {
                        return HeaderPoll::NeedMore;
                    }
                    let ct_len = u32::from_le_bytes(
                        window[state.consumed..state.consumed + 4]
                            .try_into()
                            .expect("4 bytes"),
                    ) as usize;
                    let declared = state.header.message_len;
                    if MESSAGE_ID_OFFSET + 4 + IV_LEN + ct_len != declared {
                        return HeaderPoll::Invalid(ConnectionResult::FailedUnknown);
                    }
                    if window.len() < declared {
                        return HeaderPoll::NeedMore;
                    }
                    let mut iv = [0u8; IV_LEN];
                    iv.copy_from_slice(
                        &window[state.consumed + 4..state.consumed + 4 + IV_LEN],
                    );
                    let ciphertext = &window[state.consumed + 4 + IV_LEN..declared];
                    let crypto = self.crypto.as_ref().expect("checked in Length stage");
                    let plain = match crypto.lock().decrypt(&iv, ciphertext) {
                        Ok(plain) => plain,
                        Err(_) => {
                            return HeaderPoll::Invalid(
                                ConnectionResult::MessageAuthenticationFailed,
                            );
                        }
                    };
                    state.header.iv = Some(iv);
                    state.plain = Some(plain);
                    state.plain_pos = 0;
                    state.consumed = declared;
                    state.stage = Stage::MessageId;
                }
                Stage::MessageId => {
                    let Some(bytes) = take::<4>(window, state) else {
                        return HeaderPoll::NeedMore;
                    };
                    let word = i32::from_le_bytes(bytes);
                    let (id, is_response) = MessageHeader::unpack_message_id(word);
                    state.header.message_id = id;
                    state.header.is_response = is_response;
                    state.stage = if state.header.has_type_table {
                        Stage::TypeMap
                    } else {
                        Stage::Complete
                    };
                }
                Stage::TypeMap => {
                    let Some(bytes) = peek(window, state, 2) else {
                        return HeaderPoll::NeedMore;
                    };
                    let table_len =
                        u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
                    if table_len < 4 {
                        return HeaderPoll::Invalid(ConnectionResult::FailedUnknown);
                    }
                    let Some(table) = peek(window, state, table_len) else {
                        return HeaderPoll::NeedMore;
                    };
                    if absorb_type_table(&mut state.header, &table[2..]).is_err() {
                        return HeaderPoll::Invalid(ConnectionResult::FailedUnknown);
                    }
                    advance(state, table_len);
                    state.stage = Stage::Complete;
                }
                Stage::Complete => {
                    state.header.header_len = state.consumed;
                    state.header.payload_offset = if state.plain.is_some() {
                        state.plain_pos
                    } else {
                        state.consumed
                    };
                    if state.header.message_len < state.header.header_len {
                        return HeaderPoll::Invalid(ConnectionResult::FailedUnknown);
                    }
                    return HeaderPoll::Complete;
                }
            }
        }
    }

    /// Reads the payload of a completed header out of `frame` (the full
    /// frame bytes) and verifies the trailing signature when the flags
    /// ask for one. Returns the populated message.
    pub fn read_payload(
        &self,
        header: &mut MessageHeader,
        mut message: Box<dyn Message>,
        frame: &[u8],
    ) -> Result<Box<dyn Message>> {
        let mut ctx = DeserializationContext::new(self.types.clone());
        std::mem::swap(&mut ctx.types, &mut header.types);

        let result = match header.decrypted.take() {
            Some(plain) => {
                // A decrypted frame that fails to parse was tampered
                // with or keyed wrong; either way it is an integrity
                // failure, not a framing one.
                let mut r = BufferReader::new(&plain[header.payload_offset..]);
                message
                    .read_payload(&mut ctx, &mut r)
                    .map_err(|_| Error::DecryptionFailed)?;
                Ok(())
            }
            None => {
                let end = header.message_len.min(frame.len());
                let mut r = BufferReader::new(&frame[header.payload_offset..end]);
                message.read_payload(&mut ctx, &mut r)?;
                if header.flags.authenticated && !header.flags.encrypted {
                    let sig_start = header.payload_offset + r.position();
                    let signature = r.read_bytes()?;
                    let crypto = self.crypto.as_ref().ok_or(Error::NoSessionKey)?;
                    let region = signed_region(frame, sig_start);
                    crypto.lock().verify(&region, &signature)?;
                }
                Ok(())
            }
        };
        std::mem::swap(&mut ctx.types, &mut header.types);
        result.map(|_| message)
    }

    /// Splits a plaintext authenticated frame into its signed region
    /// and signature without verifying, for callers that check with an
    /// asymmetric key (the handshake's final step).
    pub fn split_signed(&self, header: &MessageHeader, frame: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        // The signature block is the frame's tail; walk the payload to
        // find it by re-reading up to the signature prefix.
        let end = header.message_len.min(frame.len());
        let mut r = BufferReader::new(&frame[header.payload_offset..end]);
        // Skip payload by parsing into a scratch message.
        let mut scratch = self
            .registry
            .create(header.protocol_id, header.message_type)
            .ok_or(Error::UnknownMessageType {
                protocol_id: header.protocol_id,
                type_id: header.message_type,
            })?;
        let mut ctx = DeserializationContext::new(self.types.clone());
        scratch.read_payload(&mut ctx, &mut r)?;
        let sig_start = header.payload_offset + r.position();
        let signature = r.read_bytes()?;
        Ok((signed_region(frame, sig_start), signature))
    }
}

impl std::fmt::Debug for Framer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framer")
            .field("max_message_size", &self.max_message_size)
            .field("has_crypto", &self.crypto.is_some())
            .finish()
    }
}

/// Copies the bytes a signature covers: the frame up to the signature
/// block, with the length field zeroed as it was at signing time.
fn signed_region(frame: &[u8], sig_start: usize) -> Vec<u8> {
    let mut region = frame[..sig_start].to_vec();
    region[LENGTH_FIELD_OFFSET..LENGTH_FIELD_OFFSET + 4].fill(0);
    region
}

/// Commits `N` bytes from the current read source (the decrypted tail
/// when present, the wire window otherwise), advancing the state.
fn take<const N: usize>(window: &[u8], state: &mut HeaderState) -> Option<[u8; N]> {
    let mut out = [0u8; N];
    if let Some(plain) = &state.plain {
        if state.plain_pos + N > plain.len() {
            return None;
        }
        out.copy_from_slice(&plain[state.plain_pos..state.plain_pos + N]);
        state.plain_pos += N;
    } else {
        if state.consumed + N > window.len() {
            return None;
        }
        out.copy_from_slice(&window[state.consumed..state.consumed + N]);
        state.consumed += N;
    }
    Some(out)
}

/// Copies `n` bytes from the current read source without committing.
fn peek(window: &[u8], state: &HeaderState, n: usize) -> Option<Vec<u8>> {
    if let Some(plain) = &state.plain {
        if state.plain_pos + n > plain.len() {
            return None;
        }
        Some(plain[state.plain_pos..state.plain_pos + n].to_vec())
    } else {
        if state.consumed + n > window.len() {
            return None;
        }
        Some(window[state.consumed..state.consumed + n].to_vec())
    }
}

fn advance(state: &mut HeaderState, n: usize) {
    if state.plain.is_some() {
        state.plain_pos += n;
    } else {
        state.consumed += n;
    }
}

/// Parses the type-table block past its length prefix: a u16 count
/// followed by that many u32-length-prefixed UTF-8 names, bound to ids
/// in order.
fn absorb_type_table(header: &mut MessageHeader, block: &[u8]) -> Result<()> {
    let mut r = BufferReader::new(block);
    let count = r.read_u16()?;
    for id in 0..count {
        let len = r.read_u32()? as usize;
        let bytes = r.read_raw(len)?;
        let name = std::str::from_utf8(bytes)
            .map_err(|_| tempest_proto::Error::InvalidString)?
            .to_owned();
        header.types.bind(id, name).map_err(Error::Proto)?;
    }
    Ok(())
}
