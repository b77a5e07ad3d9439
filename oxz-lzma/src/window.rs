//! Sliding input window and match finders.
//!
//! The encoder's input lives in one owned buffer that keeps `keep_before`
//! bytes of history behind the read cursor and `keep_after` bytes of
//! lookahead in front of it. When the cursor nears the end, the buffer is
//! slid and `offset` grows so that `buffer_index + offset` remains the
//! absolute stream position.
//!
//! Match candidates are tracked in a single `u32` arena: small fixed hash
//! tables keyed on two and three bytes, a main hash sized from the
//! dictionary, and per-position links, either a singly linked chain (HC) or
//! a binary tree ordered lexicographically over suffixes (BT). All
//! "pointers" are absolute positions; zero is the empty sentinel, which is
//! why the very first byte is given absolute position one. When positions
//! approach the 32-bit ceiling every entry is renumbered in one sweep.

use oxz_core::crc::CRC32_TABLES;
use oxz_core::error::{Result, XzError};
use oxz_core::mem::MemLimit;

use crate::model::MATCH_LEN_MAX;

/// Size of the 2-byte auxiliary hash table.
const HASH_2_SIZE: u32 = 1 << 10;

/// Size of the 3-byte auxiliary hash table.
const HASH_3_SIZE: u32 = 1 << 16;

/// Direct 2-byte hash size used by BT2.
const BT2_HASH_SIZE: u32 = 1 << 16;

/// The empty-bucket sentinel.
const EMPTY: u32 = 0;

/// Absolute position that forces renumbering of the arena.
const NORMALIZE_POS: u32 = u32::MAX;

/// A match candidate: `dist` is zero-based (0 = the previous byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    /// Match length in bytes.
    pub len: u32,
    /// Zero-based distance.
    pub dist: u32,
}

/// Match finder flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MfKind {
    /// Hash chain keyed on 3 bytes.
    Hc3,
    /// Hash chain keyed on 4 bytes.
    Hc4,
    /// Binary tree keyed directly on 2 bytes.
    Bt2,
    /// Binary tree keyed on 3 bytes.
    Bt3,
    /// Binary tree keyed on 4 bytes.
    Bt4,
}

impl MfKind {
    fn is_chain(self) -> bool {
        matches!(self, Self::Hc3 | Self::Hc4)
    }

    fn hash_bytes(self) -> usize {
        match self {
            Self::Bt2 => 2,
            Self::Hc3 | Self::Bt3 => 3,
            Self::Hc4 | Self::Bt4 => 4,
        }
    }

    /// Shortest lookahead needed to hash a position at all.
    fn min_check(self) -> usize {
        match self {
            // BT2 verifies the third byte of direct-hash candidates.
            Self::Bt2 => 3,
            Self::Hc3 | Self::Bt3 => 3,
            Self::Hc4 | Self::Bt4 => 4,
        }
    }

    fn fix_hash_size(self) -> u32 {
        match self {
            Self::Bt2 => 0,
            Self::Hc3 | Self::Bt3 => HASH_2_SIZE,
            Self::Hc4 | Self::Bt4 => HASH_2_SIZE + HASH_3_SIZE,
        }
    }

    /// Default chain/tree walk budget for a given nice length.
    pub fn default_depth(self, nice_len: u32) -> u32 {
        if self.is_chain() {
            8 + nice_len / 4
        } else {
            16 + nice_len / 2
        }
    }

    /// Size of the main hash and its mask for a dictionary size.
    fn main_hash(self, dict_size: u32) -> (u32, u32) {
        if self == Self::Bt2 {
            // Direct 16-bit key; the mask is unused.
            return (BT2_HASH_SIZE, 0);
        }

        let mut hs = dict_size - 1;
        hs |= hs >> 1;
        hs |= hs >> 2;
        hs |= hs >> 4;
        hs |= hs >> 8;
        hs >>= 1;
        hs |= 0xFFFF;

        if hs > 1 << 24 {
            if self.hash_bytes() == 4 {
                hs >>= 1;
            } else {
                hs = (1 << 24) - 1;
            }
        }

        (hs + 1, hs)
    }
}

/// Sliding window plus match finder state.
#[derive(Debug)]
pub struct MatchFinder {
    kind: MfKind,

    buf: Vec<u8>,
    keep_before: usize,
    keep_after: usize,

    /// Absolute position of buffer index 0 (wrapping).
    offset: u32,
    read_pos: usize,
    read_limit: usize,
    write_pos: usize,
    /// How far `read_pos` is ahead of the position being encoded.
    read_ahead: usize,
    /// Positions advanced without hashing while input was starved.
    pending: usize,
    stream_end: bool,

    /// Fixed hash tables, main hash and son links in one arena.
    items: Vec<u32>,
    son_start: usize,
    hash_mask: u32,
    fix_hash_size: usize,

    cyclic_pos: u32,
    cyclic_size: u32,
    depth: u32,
    nice_len: usize,
}

impl MatchFinder {
    /// Bytes of memory a finder with these parameters will allocate.
    pub fn memusage(kind: MfKind, dict_size: u32, _nice_len: u32) -> u64 {
        let keep_before = dict_size as u64;
        let keep_after = MATCH_LEN_MAX as u64;
        let reserve = (keep_before + keep_after) / 2 + 256;
        let buf = keep_before + keep_after + reserve;

        let (main_hash, _) = kind.main_hash(dict_size);
        let sons = if kind.is_chain() { 1u64 } else { 2 };
        let cyclic = u64::from(dict_size) + 1;
        let items = u64::from(kind.fix_hash_size()) + u64::from(main_hash) + cyclic * sons;

        buf + items * 4
    }

    /// Create a finder over an empty window.
    ///
    /// When a memory limit is given the full allocation is claimed against
    /// it first.
    pub fn new(
        kind: MfKind,
        dict_size: u32,
        nice_len: u32,
        depth: u32,
        mem: Option<&mut MemLimit>,
    ) -> Result<Self> {
        if dict_size < 4096 {
            return Err(XzError::options("dictionary size below 4096 bytes"));
        }
        if !(MATCH_LEN_MIN_NICE..=MATCH_LEN_MAX as u32).contains(&nice_len) {
            return Err(XzError::options("nice length out of range"));
        }

        if let Some(mem) = mem {
            mem.claim(Self::memusage(kind, dict_size, nice_len))?;
        }

        let keep_before = dict_size as usize;
        let keep_after = MATCH_LEN_MAX;
        let reserve = (keep_before + keep_after) / 2 + 256;
        let size = keep_before + keep_after + reserve;

        let (main_hash, hash_mask) = kind.main_hash(dict_size);
        let fix_hash_size = kind.fix_hash_size() as usize;
        let cyclic_size = dict_size + 1;
        let sons = if kind.is_chain() { 1usize } else { 2 };
        let son_start = fix_hash_size + main_hash as usize;
        let items = son_start + cyclic_size as usize * sons;

        Ok(Self {
            kind,
            buf: vec![0; size],
            keep_before,
            keep_after,
            // Position zero is the empty sentinel, so the stream starts at
            // absolute position one.
            offset: 1,
            read_pos: 0,
            read_limit: 0,
            write_pos: 0,
            read_ahead: 0,
            pending: 0,
            stream_end: false,
            items: vec![EMPTY; items],
            son_start,
            hash_mask,
            fix_hash_size,
            cyclic_pos: 0,
            cyclic_size,
            depth: if depth == 0 {
                kind.default_depth(nice_len)
            } else {
                depth
            },
            nice_len: nice_len as usize,
        })
    }

    /// Reset to an empty window, as a LZMA2 dictionary reset does.
    pub fn reset(&mut self) {
        self.offset = 1;
        self.read_pos = 0;
        self.read_limit = 0;
        self.write_pos = 0;
        self.read_ahead = 0;
        self.pending = 0;
        self.stream_end = false;
        self.items.fill(EMPTY);
        self.cyclic_pos = 0;
    }

    /// The configured nice length.
    pub fn nice_len(&self) -> usize {
        self.nice_len
    }

    /// Bytes buffered beyond the read cursor.
    pub fn lookahead(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Bytes available to the encoder at the current encode position,
    /// including what the cursor has already run ahead over.
    pub fn avail(&self) -> usize {
        self.lookahead() + self.read_ahead
    }

    /// Whether the cursor may keep encoding: enough lookahead is buffered,
    /// or the stream end is known so the tail may be drained.
    pub fn can_encode(&self) -> bool {
        self.read_pos < self.read_limit || (self.stream_end && self.avail() > 0)
    }

    /// How far the read cursor runs ahead of the encode position.
    pub fn read_ahead(&self) -> usize {
        self.read_ahead
    }

    /// Whether the stream end was signalled and everything is consumed.
    pub fn is_drained(&self) -> bool {
        self.stream_end && self.avail() == 0
    }

    /// Whether the end (or a flush boundary) has been signalled.
    pub fn is_ended(&self) -> bool {
        self.stream_end
    }

    /// The last `len` bytes before the encode position, unmodified input.
    /// Used to re-emit data verbatim when compression did not pay off.
    pub fn recent_bytes(&self, len: usize) -> &[u8] {
        let cur = self.read_pos - self.read_ahead;
        &self.buf[cur - len..cur]
    }

    /// Byte at `index` bytes past the encode position.
    #[inline]
    pub fn byte_ahead(&self, index: usize) -> u8 {
        self.buf[self.read_pos - self.read_ahead + index]
    }

    /// Byte `dist + 1` positions before `byte_ahead(0)`.
    #[inline]
    pub fn byte_back(&self, dist: u32) -> u8 {
        self.buf[self.read_pos - self.read_ahead - dist as usize - 1]
    }

    /// Byte `dist + 1` positions before the byte `offset` bytes past the
    /// encode position.
    #[inline]
    pub fn byte_back_at(&self, offset: usize, dist: u32) -> u8 {
        self.buf[self.read_pos - self.read_ahead + offset - dist as usize - 1]
    }

    /// Longest common prefix of the lookahead and the data at `dist`,
    /// starting the comparison at `start` and capped by `limit`.
    pub fn match_len(&self, dist: u32, start: usize, limit: usize) -> usize {
        self.match_len_at(0, dist, start, limit)
    }

    /// Like [`MatchFinder::match_len`] but for the position `offset` bytes
    /// past the encode position.
    pub fn match_len_at(&self, offset: usize, dist: u32, start: usize, limit: usize) -> usize {
        let cur = self.read_pos - self.read_ahead + offset;
        let back = cur - dist as usize - 1;
        let mut len = start;
        while len < limit && self.buf[cur + len] == self.buf[back + len] {
            len += 1;
        }
        len
    }

    /// Consume the encode position after a symbol of `len` bytes.
    #[inline]
    pub fn forward(&mut self, len: usize) {
        debug_assert!(self.read_ahead >= len);
        self.read_ahead -= len;
    }

    /// Copy caller input into the window. Returns bytes taken. `finish`
    /// marks the end of the stream (or of a flush boundary), allowing the
    /// cursor to reach the very last byte.
    pub fn fill(&mut self, input: &[u8], finish: bool) -> usize {
        if self.read_pos >= self.buf.len() - self.keep_after {
            self.move_window();
        }

        let take = input.len().min(self.buf.len() - self.write_pos);
        self.buf[self.write_pos..self.write_pos + take].copy_from_slice(&input[..take]);
        self.write_pos += take;

        if finish && take == input.len() {
            self.stream_end = true;
            self.read_limit = self.write_pos;
        } else if self.write_pos > self.keep_after {
            self.read_limit = self.write_pos - self.keep_after;
        }

        // Positions skipped while starved can be hashed now that data
        // arrived.
        if self.pending > 0 && self.read_pos < self.read_limit {
            let pending = self.pending;
            self.pending = 0;
            self.read_pos -= pending;
            debug_assert!(self.read_ahead >= pending);
            self.read_ahead -= pending;
            self.skip(pending);
        }

        take
    }

    /// Reopen the window after a flush boundary so more input can follow.
    pub fn reopen(&mut self) {
        self.stream_end = false;
        if self.write_pos > self.keep_after {
            self.read_limit = self.write_pos - self.keep_after;
        } else {
            self.read_limit = 0;
        }
    }

    fn move_window(&mut self) {
        let mut move_offset = self.read_pos.saturating_sub(self.keep_before);
        if move_offset > 0 {
            move_offset -= 1;
        }
        if move_offset == 0 {
            return;
        }

        self.buf.copy_within(move_offset..self.write_pos, 0);
        self.offset = self.offset.wrapping_add(move_offset as u32);
        self.read_pos -= move_offset;
        self.read_limit = self.read_limit.saturating_sub(move_offset);
        self.write_pos -= move_offset;
    }

    /// Renumber every arena entry so 32-bit positions cannot overflow.
    fn normalize(&mut self) {
        let subvalue = NORMALIZE_POS - self.cyclic_size;
        for item in &mut self.items {
            if *item <= subvalue {
                *item = EMPTY;
            } else {
                *item -= subvalue;
            }
        }
        self.offset = self.offset.wrapping_sub(subvalue);
    }

    /// Advance past a position that cannot be hashed yet for lack of
    /// lookahead. Mid-stream the cyclic counter is deliberately left
    /// behind: `fill` rewinds and re-skips these positions once data
    /// arrives, which restores the `read_pos`/`cyclic_pos` lockstep. At a
    /// flush boundary no rewind will come, so the counters advance
    /// together and the position simply stays unhashed.
    #[inline]
    fn move_pending(&mut self) {
        if self.stream_end {
            self.move_pos();
        } else {
            self.pending += 1;
            self.read_pos += 1;
        }
    }

    #[inline]
    fn move_pos(&mut self) {
        self.cyclic_pos += 1;
        if self.cyclic_pos == self.cyclic_size {
            self.cyclic_pos = 0;
        }
        self.read_pos += 1;
        if (self.read_pos as u32).wrapping_add(self.offset) == NORMALIZE_POS {
            self.normalize();
        }
    }

    /// Hash keys for the bytes at the read cursor.
    #[inline]
    fn hashes(&self, cur: usize) -> (u32, u32, u32) {
        let b = &self.buf;
        match self.kind {
            MfKind::Bt2 => {
                let hv = u32::from(b[cur]) ^ (u32::from(b[cur + 1]) << 8);
                (0, 0, hv)
            }
            MfKind::Hc3 | MfKind::Bt3 => {
                let temp = CRC32_TABLES[0][b[cur] as usize] ^ u32::from(b[cur + 1]);
                let h2 = temp & (HASH_2_SIZE - 1);
                let hv = (temp ^ (u32::from(b[cur + 2]) << 8)) & self.hash_mask;
                (h2, 0, hv)
            }
            MfKind::Hc4 | MfKind::Bt4 => {
                let temp = CRC32_TABLES[0][b[cur] as usize] ^ u32::from(b[cur + 1]);
                let h2 = temp & (HASH_2_SIZE - 1);
                let h3 = (temp ^ (u32::from(b[cur + 2]) << 8)) & (HASH_3_SIZE - 1);
                let hv = (temp
                    ^ (u32::from(b[cur + 2]) << 8)
                    ^ (CRC32_TABLES[0][b[cur + 3] as usize] << 5))
                    & self.hash_mask;
                (h2, h3, hv)
            }
        }
    }

    /// Report all matches at the encode position and advance by one byte.
    ///
    /// Matches are appended in strictly increasing length order; the return
    /// value is the longest length found (zero if none). The search stops
    /// early once a match of at least the nice length appears.
    pub fn get_matches(&mut self, matches: &mut Vec<Match>) -> u32 {
        matches.clear();
        self.read_ahead += 1;

        let avail = self.write_pos - self.read_pos;
        let len_limit = if avail >= MATCH_LEN_MAX {
            MATCH_LEN_MAX
        } else {
            if avail < self.kind.min_check() {
                self.move_pending();
                return 0;
            }
            avail
        };
        let len_limit = len_limit.min(self.nice_len.max(self.kind.min_check()));

        let cur = self.read_pos;
        let pos_abs = (self.read_pos as u32).wrapping_add(self.offset);
        let match_min_pos = if pos_abs > self.cyclic_size {
            pos_abs - self.cyclic_size
        } else {
            0
        };

        let (h2, h3, hv) = self.hashes(cur);
        let mut max_len = 1usize;
        let mut cur_match = self.items[self.fix_hash_size + hv as usize];

        if self.kind != MfKind::Bt2 {
            let cur_match2 = self.items[h2 as usize];
            self.items[h2 as usize] = pos_abs;
            let mut best2 = EMPTY;

            if cur_match2 > match_min_pos
                && self.buf[(cur_match2.wrapping_sub(self.offset)) as usize] == self.buf[cur]
            {
                max_len = 2;
                matches.push(Match {
                    len: 2,
                    dist: pos_abs - cur_match2 - 1,
                });
                best2 = cur_match2;
            }

            if self.kind.hash_bytes() == 4 {
                let cur_match3 = self.items[(HASH_2_SIZE + h3) as usize];
                self.items[(HASH_2_SIZE + h3) as usize] = pos_abs;

                if cur_match3 > match_min_pos
                    && self.buf[(cur_match3.wrapping_sub(self.offset)) as usize] == self.buf[cur]
                {
                    if cur_match3 == best2 {
                        matches.pop();
                    }
                    max_len = 3;
                    matches.push(Match {
                        len: 3,
                        dist: pos_abs - cur_match3 - 1,
                    });
                    best2 = cur_match3;
                }
            }

            if !matches.is_empty() && best2 == cur_match {
                matches.pop();
                max_len = 1;
            }
        }

        self.items[self.fix_hash_size + hv as usize] = pos_abs;

        if self.kind == MfKind::Bt2 && cur_match > match_min_pos {
            // The 16-bit direct key guarantees two matching bytes; report a
            // length-2 match only when the tree walk cannot extend it.
            let idx = (cur_match.wrapping_sub(self.offset)) as usize;
            if self.buf[idx + 2] != self.buf[cur + 2] {
                max_len = 2;
                matches.push(Match {
                    len: 2,
                    dist: pos_abs - cur_match - 1,
                });
            }
        }

        if self.kind.is_chain() {
            self.items[self.son_start + self.cyclic_pos as usize] = cur_match;
            let mut count = self.depth;

            while cur_match > match_min_pos && count > 0 {
                count -= 1;
                let delta = pos_abs - cur_match;
                let cyclic = if delta <= self.cyclic_pos {
                    self.cyclic_pos - delta
                } else {
                    self.cyclic_pos + self.cyclic_size - delta
                };
                let pair = self.son_start + cyclic as usize;
                let pb = (cur_match.wrapping_sub(self.offset)) as usize;

                if self.buf[pb + max_len] == self.buf[cur + max_len] && self.buf[pb] == self.buf[cur]
                {
                    let mut len = 1;
                    while len < len_limit && self.buf[pb + len] == self.buf[cur + len] {
                        len += 1;
                    }
                    if max_len < len {
                        max_len = len;
                        matches.push(Match {
                            len: len as u32,
                            dist: delta - 1,
                        });
                        if len == len_limit {
                            break;
                        }
                    }
                }

                cur_match = self.items[pair];
            }
        } else {
            let direct = if self.kind == MfKind::Bt2 { 2usize } else { 0 };
            let mut ptr0 = self.son_start + ((self.cyclic_pos as usize) << 1) + 1;
            let mut ptr1 = self.son_start + ((self.cyclic_pos as usize) << 1);
            let mut len0 = direct;
            let mut len1 = direct;
            let mut count = self.depth;

            loop {
                if cur_match <= match_min_pos || count == 0 {
                    self.items[ptr0] = EMPTY;
                    self.items[ptr1] = EMPTY;
                    break;
                }
                count -= 1;

                let delta = pos_abs - cur_match;
                let cyclic = if delta <= self.cyclic_pos {
                    self.cyclic_pos - delta
                } else {
                    self.cyclic_pos + self.cyclic_size - delta
                };
                let pair = self.son_start + ((cyclic as usize) << 1);
                let pb = (cur_match.wrapping_sub(self.offset)) as usize;
                let mut len = len0.min(len1);

                if self.buf[pb + len] == self.buf[cur + len] {
                    len += 1;
                    while len < len_limit && self.buf[pb + len] == self.buf[cur + len] {
                        len += 1;
                    }
                    if max_len < len {
                        max_len = len;
                        matches.push(Match {
                            len: len as u32,
                            dist: delta - 1,
                        });
                        if len == len_limit {
                            self.items[ptr1] = self.items[pair];
                            self.items[ptr0] = self.items[pair + 1];
                            break;
                        }
                    }
                }

                if self.buf[pb + len] < self.buf[cur + len] {
                    self.items[ptr1] = cur_match;
                    ptr1 = pair + 1;
                    cur_match = self.items[ptr1];
                    len1 = len;
                } else {
                    self.items[ptr0] = cur_match;
                    ptr0 = pair;
                    cur_match = self.items[ptr0];
                    len0 = len;
                }
            }
        }

        self.move_pos();
        matches.last().map_or(0, |m| m.len)
    }

    /// Advance `num` positions, keeping the hash and tree structures
    /// current without collecting matches.
    pub fn skip(&mut self, num: usize) {
        for _ in 0..num {
            self.read_ahead += 1;
            let avail = self.write_pos - self.read_pos;

            if avail < self.kind.min_check() {
                self.move_pending();
                continue;
            }

            let len_limit = avail
                .min(MATCH_LEN_MAX)
                .min(self.nice_len.max(self.kind.min_check()));
            let cur = self.read_pos;
            let pos_abs = (self.read_pos as u32).wrapping_add(self.offset);
            let match_min_pos = if pos_abs > self.cyclic_size {
                pos_abs - self.cyclic_size
            } else {
                0
            };

            let (h2, h3, hv) = self.hashes(cur);
            if self.kind != MfKind::Bt2 {
                self.items[h2 as usize] = pos_abs;
                if self.kind.hash_bytes() == 4 {
                    self.items[(HASH_2_SIZE + h3) as usize] = pos_abs;
                }
            }

            let mut cur_match = self.items[self.fix_hash_size + hv as usize];
            self.items[self.fix_hash_size + hv as usize] = pos_abs;

            if self.kind.is_chain() {
                self.items[self.son_start + self.cyclic_pos as usize] = cur_match;
            } else {
                let direct = if self.kind == MfKind::Bt2 { 2usize } else { 0 };
                let mut ptr0 = self.son_start + ((self.cyclic_pos as usize) << 1) + 1;
                let mut ptr1 = self.son_start + ((self.cyclic_pos as usize) << 1);
                let mut len0 = direct;
                let mut len1 = direct;
                let mut count = self.depth;

                loop {
                    if cur_match <= match_min_pos || count == 0 {
                        self.items[ptr0] = EMPTY;
                        self.items[ptr1] = EMPTY;
                        break;
                    }
                    count -= 1;

                    let delta = pos_abs - cur_match;
                    let cyclic = if delta <= self.cyclic_pos {
                        self.cyclic_pos - delta
                    } else {
                        self.cyclic_pos + self.cyclic_size - delta
                    };
                    let pair = self.son_start + ((cyclic as usize) << 1);
                    let pb = (cur_match.wrapping_sub(self.offset)) as usize;
                    let mut len = len0.min(len1);

                    if self.buf[pb + len] == self.buf[cur + len] {
                        len += 1;
                        while len < len_limit && self.buf[pb + len] == self.buf[cur + len] {
                            len += 1;
                        }
                        if len == len_limit {
                            self.items[ptr1] = self.items[pair];
                            self.items[ptr0] = self.items[pair + 1];
                            break;
                        }
                    }

                    if self.buf[pb + len] < self.buf[cur + len] {
                        self.items[ptr1] = cur_match;
                        ptr1 = pair + 1;
                        cur_match = self.items[ptr1];
                        len1 = len;
                    } else {
                        self.items[ptr0] = cur_match;
                        ptr0 = pair;
                        cur_match = self.items[ptr0];
                        len0 = len;
                    }
                }
            }

            self.move_pos();
        }
    }
}

/// Lower bound for the nice length option.
const MATCH_LEN_MIN_NICE: u32 = 8;

#[cfg(test)]
mod tests {
    use super::*;

    fn finder(kind: MfKind, data: &[u8]) -> MatchFinder {
        let mut mf = MatchFinder::new(kind, 1 << 16, 64, 0, None).unwrap();
        let taken = mf.fill(data, true);
        assert_eq!(taken, data.len());
        mf
    }

    fn all_kinds() -> [MfKind; 5] {
        [MfKind::Hc3, MfKind::Hc4, MfKind::Bt2, MfKind::Bt3, MfKind::Bt4]
    }

    #[test]
    fn test_finds_repeated_block() {
        let mut data = b"abcdefgh".repeat(4);
        data.extend_from_slice(b"abcdefgh");

        for kind in all_kinds() {
            let mut mf = finder(kind, &data);
            let mut matches = Vec::new();

            // Advance to the second copy of the block.
            mf.skip(8);
            mf.forward(8);
            let len = mf.get_matches(&mut matches);
            mf.forward(1);

            assert!(len >= 8, "{kind:?}: found len {len}");
            let best = matches.last().unwrap();
            assert_eq!(best.dist, 7, "{kind:?}: wrong distance");
        }
    }

    #[test]
    fn test_lengths_strictly_increase() {
        let data: Vec<u8> = (0..4000u32).map(|i| (i % 7) as u8).collect();
        for kind in all_kinds() {
            let mut mf = finder(kind, &data);
            let mut matches = Vec::new();

            mf.skip(100);
            mf.forward(100);
            for _ in 0..200 {
                mf.get_matches(&mut matches);
                mf.forward(1);
                for pair in matches.windows(2) {
                    assert!(pair[0].len < pair[1].len, "{kind:?}: not increasing");
                }
            }
        }
    }

    #[test]
    fn test_matches_verify_against_buffer() {
        let data: Vec<u8> = (0..3000u32)
            .map(|i| ((i * i) % 11 + (i % 3) * 16) as u8)
            .collect();

        for kind in all_kinds() {
            let mut mf = finder(kind, &data);
            let mut matches = Vec::new();
            let mut pos = 0usize;

            while pos + 1 < data.len() - MATCH_LEN_MAX {
                mf.get_matches(&mut matches);
                for m in &matches {
                    let d = m.dist as usize + 1;
                    assert!(d <= pos, "{kind:?}: distance past start");
                    for k in 0..m.len as usize {
                        assert_eq!(
                            data[pos + k],
                            data[pos + k - d],
                            "{kind:?}: bogus match at {pos} len {} dist {}",
                            m.len,
                            m.dist
                        );
                    }
                }
                mf.forward(1);
                pos += 1;
            }
        }
    }

    #[test]
    fn test_nice_len_caps_reported_length() {
        let data = vec![0x41u8; 2000];
        let mut mf = MatchFinder::new(MfKind::Bt4, 1 << 16, 16, 0, None).unwrap();
        mf.fill(&data, true);

        let mut matches = Vec::new();
        mf.skip(100);
        mf.forward(100);
        let len = mf.get_matches(&mut matches);
        mf.forward(1);
        assert!(len >= 8 && len <= 16, "len {len} ignores the nice cutoff");
    }

    #[test]
    fn test_incremental_fill_matches_oneshot() {
        let data: Vec<u8> = (0..6000u32).map(|i| ((i / 5) % 13) as u8).collect();

        let collect = |mf: &mut MatchFinder, n: usize| {
            let mut out = Vec::new();
            let mut matches = Vec::new();
            for _ in 0..n {
                mf.get_matches(&mut matches);
                out.push(matches.last().copied());
                mf.forward(1);
            }
            out
        };

        let mut oneshot = finder(MfKind::Bt4, &data);
        let expect = collect(&mut oneshot, 2000);

        let mut chunked = MatchFinder::new(MfKind::Bt4, 1 << 16, 64, 0, None).unwrap();
        let mut fed = 0;
        while fed < data.len() {
            let n = 701.min(data.len() - fed);
            let taken = chunked.fill(&data[fed..fed + n], fed + n == data.len());
            fed += taken;
        }
        let got = collect(&mut chunked, 2000);

        assert_eq!(expect, got);
    }

    #[test]
    fn test_memusage_claimed() {
        let mut mem = MemLimit::new(64);
        let err = MatchFinder::new(MfKind::Hc3, 1 << 16, 32, 0, Some(&mut mem)).unwrap_err();
        assert!(matches!(err, XzError::MemLimit { .. }));
        assert!(mem.peak_requested() >= MatchFinder::memusage(MfKind::Hc3, 1 << 16, 32));
    }

    #[test]
    fn test_window_slide_preserves_matching() {
        // Feed enough data to slide the window several times and make sure
        // reported matches still verify.
        let dict = 4096u32;
        let mut mf = MatchFinder::new(MfKind::Hc4, dict, 32, 0, None).unwrap();
        let data: Vec<u8> = (0..60_000u32).map(|i| ((i * 31) % 17) as u8).collect();

        let mut matches = Vec::new();
        let mut fed = 0usize;
        let mut pos = 0usize;
        loop {
            if mf.can_encode() {
                mf.get_matches(&mut matches);
                if let Some(m) = matches.last() {
                    let d = m.dist as usize + 1;
                    for k in 0..(m.len as usize).min(8) {
                        assert_eq!(data[pos + k], data[pos + k - d], "slide broke match");
                    }
                }
                mf.forward(1);
                pos += 1;
            } else if fed < data.len() {
                let n = 2048.min(data.len() - fed);
                fed += mf.fill(&data[fed..fed + n], fed + n == data.len());
            } else {
                break;
            }
        }
        assert!(pos > 50_000);
    }
}
