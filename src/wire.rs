//! Canonical byte layout for bundle envelopes and chunk framing (§4.6,
//! §4.7 step 4). All integers are little-endian. Nothing here touches the
//! store or the network — pure encode/decode plus the chunk reassembly
//! state machine.

use crate::error::{SyncErrorKind, VaultError, VaultResult};
use crate::store::VaultEntryRow;

/// Upper bound on a single chunk's payload. Frames on the wire are
/// `8 + N` bytes where `N <= MAX_CHUNK_DATA`.
pub const MAX_CHUNK_DATA: usize = 493;

// ---- Envelope ----

/// The per-entry record transmitted during sync: versioned metadata plus
/// session-key ciphertext of the entry's payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub entry_uuid: [u8; 16],
    pub profile_id: u64,
    pub sync_version: u64,
    pub updated_at: String,
    pub label: String,
    pub is_tombstone: bool,
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    pub fn entry_uuid_string(&self) -> String {
        uuid::Uuid::from_bytes(self.entry_uuid).to_string()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + 8 + 8 + 2 + self.updated_at.len() + 2 + self.label.len() + 1 + 12 + 4 + self.ciphertext.len());
        out.extend_from_slice(&self.entry_uuid);
        out.extend_from_slice(&self.profile_id.to_le_bytes());
        out.extend_from_slice(&self.sync_version.to_le_bytes());
        write_len_prefixed(&mut out, self.updated_at.as_bytes());
        write_len_prefixed(&mut out, self.label.as_bytes());
        out.push(self.is_tombstone as u8);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&(self.ciphertext.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Decodes one envelope starting at `buf[0..]`, returning the
    /// envelope and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> VaultResult<(Self, usize)> {
        let mut pos = 0usize;
        let entry_uuid = read_array::<16>(buf, &mut pos)?;
        let profile_id = u64::from_le_bytes(read_array::<8>(buf, &mut pos)?);
        let sync_version = u64::from_le_bytes(read_array::<8>(buf, &mut pos)?);
        let updated_at_bytes = read_len_prefixed(buf, &mut pos)?;
        let updated_at = String::from_utf8(updated_at_bytes)
            .map_err(|_| VaultError::Sync(SyncErrorKind::FramingError))?;
        let label_bytes = read_len_prefixed(buf, &mut pos)?;
        let label = String::from_utf8(label_bytes).map_err(|_| VaultError::Sync(SyncErrorKind::FramingError))?;
        let is_tombstone = read_u8(buf, &mut pos)? != 0;
        let nonce = read_array::<12>(buf, &mut pos)?;
        let ct_len = u32::from_le_bytes(read_array::<4>(buf, &mut pos)?) as usize;
        if buf.len() < pos + ct_len {
            return Err(VaultError::Sync(SyncErrorKind::FramingError));
        }
        let ciphertext = buf[pos..pos + ct_len].to_vec();
        pos += ct_len;
        Ok((
            Envelope {
                entry_uuid,
                profile_id,
                sync_version,
                updated_at,
                label,
                is_tombstone,
                nonce,
                ciphertext,
            },
            pos,
        ))
    }

    pub fn from_row(row: &VaultEntryRow, nonce: [u8; 12], ciphertext: Vec<u8>) -> VaultResult<Self> {
        let uuid = uuid::Uuid::parse_str(&row.entry_uuid)
            .map_err(|_| VaultError::Sync(SyncErrorKind::FramingError))?;
        Ok(Envelope {
            entry_uuid: *uuid.as_bytes(),
            profile_id: row.profile_id as u64,
            sync_version: row.sync_version as u64,
            updated_at: row.updated_at.clone(),
            label: row.label.clone(),
            is_tombstone: row.is_tombstone(),
            nonce,
            ciphertext,
        })
    }
}

/// The sequence of envelopes sent in one sync session:
/// `entry_count (u32 LE) || envelope_1 || envelope_2 || ...`.
pub fn encode_bundle(envelopes: &[Envelope]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(envelopes.len() as u32).to_le_bytes());
    for e in envelopes {
        out.extend_from_slice(&e.encode());
    }
    out
}

pub fn decode_bundle(buf: &[u8]) -> VaultResult<Vec<Envelope>> {
    let mut pos = 0usize;
    let count = u32::from_le_bytes(read_array::<4>(buf, &mut pos)?) as usize;
    let mut envelopes = Vec::with_capacity(count);
    for _ in 0..count {
        let (envelope, consumed) = Envelope::decode(&buf[pos..])?;
        pos += consumed;
        envelopes.push(envelope);
    }
    Ok(envelopes)
}

fn write_len_prefixed(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u16).to_le_bytes());
    out.extend_from_slice(data);
}

fn read_u8(buf: &[u8], pos: &mut usize) -> VaultResult<u8> {
    if buf.len() < *pos + 1 {
        return Err(VaultError::Sync(SyncErrorKind::FramingError));
    }
    let v = buf[*pos];
    *pos += 1;
    Ok(v)
}

fn read_array<const N: usize>(buf: &[u8], pos: &mut usize) -> VaultResult<[u8; N]> {
    if buf.len() < *pos + N {
        return Err(VaultError::Sync(SyncErrorKind::FramingError));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[*pos..*pos + N]);
    *pos += N;
    Ok(out)
}

fn read_len_prefixed(buf: &[u8], pos: &mut usize) -> VaultResult<Vec<u8>> {
    let len = u16::from_le_bytes(read_array::<2>(buf, pos)?) as usize;
    if buf.len() < *pos + len {
        return Err(VaultError::Sync(SyncErrorKind::FramingError));
    }
    let data = buf[*pos..*pos + len].to_vec();
    *pos += len;
    Ok(data)
}

// ---- Chunk framing ----

/// One on-wire chunk: `index(u16 LE) || total(u16 LE) || crc32(u32 LE) ||
/// payload`.
pub struct Chunk {
    pub index: u16,
    pub total: u16,
    pub payload: Vec<u8>,
}

impl Chunk {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.payload.len());
        out.extend_from_slice(&self.index.to_le_bytes());
        out.extend_from_slice(&self.total.to_le_bytes());
        out.extend_from_slice(&crate::crypto::crc32(&self.payload).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(frame: &[u8]) -> VaultResult<Self> {
        if frame.len() < 8 {
            return Err(VaultError::Sync(SyncErrorKind::FramingError));
        }
        let index = u16::from_le_bytes([frame[0], frame[1]]);
        let total = u16::from_le_bytes([frame[2], frame[3]]);
        let crc = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        let payload = frame[8..].to_vec();
        if crate::crypto::crc32(&payload) != crc {
            return Err(VaultError::Sync(SyncErrorKind::FramingError));
        }
        if total == 0 || index >= total {
            return Err(VaultError::Sync(SyncErrorKind::FramingError));
        }
        Ok(Chunk { index, total, payload })
    }
}

/// Split `data` into chunks of at most [`MAX_CHUNK_DATA`] bytes. An empty
/// buffer still produces exactly one (empty-payload) chunk, so the
/// receiver always has a `total` to allocate against.
pub fn chunk(data: &[u8]) -> Vec<Chunk> {
    if data.is_empty() {
        return vec![Chunk {
            index: 0,
            total: 1,
            payload: Vec::new(),
        }];
    }
    let total = data.chunks(MAX_CHUNK_DATA).count() as u16;
    data.chunks(MAX_CHUNK_DATA)
        .enumerate()
        .map(|(i, payload)| Chunk {
            index: i as u16,
            total,
            payload: payload.to_vec(),
        })
        .collect()
}

/// Reassembles chunks arriving in arbitrary order, tolerating duplicates.
/// A CRC or `total` mismatch is caught at decode time by [`Chunk::decode`];
/// a chunk whose declared `total` disagrees with an already-seen chunk
/// also aborts reassembly.
pub struct Reassembler {
    total: Option<u16>,
    slots: Vec<Option<Vec<u8>>>,
    filled: usize,
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            total: None,
            slots: Vec::new(),
            filled: 0,
        }
    }

    /// Feed one decoded chunk. Returns `Ok(true)` once every slot is
    /// filled.
    pub fn accept(&mut self, chunk: Chunk) -> VaultResult<bool> {
        match self.total {
            None => {
                self.total = Some(chunk.total);
                self.slots = vec![None; chunk.total as usize];
            }
            Some(total) if total != chunk.total => {
                return Err(VaultError::Sync(SyncErrorKind::FramingError));
            }
            _ => {}
        }
        let idx = chunk.index as usize;
        if self.slots[idx].is_none() {
            self.filled += 1;
        }
        self.slots[idx] = Some(chunk.payload);
        Ok(self.filled == self.slots.len())
    }

    /// Concatenate payloads in index order. Only meaningful once
    /// `accept` has returned `Ok(true)`.
    pub fn finish(self) -> VaultResult<Vec<u8>> {
        let mut out = Vec::new();
        for slot in self.slots {
            out.extend(slot.ok_or(VaultError::Sync(SyncErrorKind::FramingError))?);
        }
        Ok(out)
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}
