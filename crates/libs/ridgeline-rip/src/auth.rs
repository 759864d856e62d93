//! RIPv2 authentication (RFC 2453 §4.1, RFC 2082).
//!
//! Three runtime-selectable handlers: pass-through, plaintext password,
//! and MD5 with a keychain of validity-windowed keys. An MD5 handler
//! with no currently-valid key behaves exactly like the pass-through
//! handler in both directions.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::rc::{Rc, Weak};

use md5::{Digest, Md5};

use ridgeline_event::{TimeVal, Timer, TimerList};

use crate::packets::{
    PacketError, RipPacket, ADDR_FAMILY_AUTH, ENTRY_BYTES, HEADER_BYTES, MAX_PACKET_BYTES,
    MIN_AUTH_PACKET_BYTES, MIN_PACKET_BYTES,
};

/// Authentication type code carried in the route-tag field of the auth
/// entry.
pub const AUTH_TYPE_PLAINTEXT: u16 = 2;
pub const AUTH_TYPE_MD5: u16 = 3;

/// MD5 trailer: family, the RFC 2082 constant 1, 16 digest bytes.
pub const MD5_TRAILER_BYTES: usize = 20;
/// Offset of the digest within the trailer.
pub const MD5_TRAILER_DIGEST_OFFSET: usize = 4;

pub const KEY_BYTES: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("authentication type mismatch (expected {expected}, got {got})")]
    AuthTypeMismatch { expected: u16, got: u16 },

    #[error("wrong password")]
    WrongPassword,

    #[error("packet with key ID {0} for which no key is configured")]
    BadKeyId(u8),

    #[error("bad sequence number {seqno:#010x} < {last:#010x}")]
    ReplaySeqno { seqno: u32, last: u32 },

    #[error("authentication digest does not match local key (key ID {key_id})")]
    DigestMismatch { key_id: u8 },

    #[error("invalid authentication trailer")]
    InvalidTrailer,

    #[error("wrong number of auth trailer bytes ({0})")]
    WrongAuthBytes(u8),

    #[error("auth offset {offset} + {bytes} trailer bytes != {packet} packet bytes")]
    BadAuthOffset {
        offset: u16,
        bytes: u8,
        packet: usize,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("start time is later than the end time")]
    StartAfterEnd,

    #[error("end time is in the past")]
    EndInPast,

    #[error("no such key")]
    NoSuchKey,
}

/// Slice of validated routing entries within an inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundEntries {
    /// Byte offset of the first routing entry.
    pub offset: usize,
    /// Number of routing entries (auth entries excluded).
    pub n_entries: usize,
}

fn entries_or_empty(offset: usize, n_entries: usize) -> InboundEntries {
    InboundEntries { offset, n_entries }
}

/// Common size/shape validation shared by every handler.
fn check_shape(packet: &[u8], max_bytes: usize, min_bytes: usize) -> Result<usize, PacketError> {
    if packet.len() > max_bytes {
        return Err(PacketError::PacketTooLarge(packet.len()));
    }
    if packet.len() < min_bytes {
        return Err(PacketError::PacketTooSmall(packet.len()));
    }
    let entry_bytes = packet.len() - HEADER_BYTES;
    if entry_bytes % ENTRY_BYTES != 0 {
        return Err(PacketError::NonIntegralEntries(entry_bytes));
    }
    Ok(entry_bytes / ENTRY_BYTES)
}

// ---------------------------------------------------------------------------
// Pass-through

/// No authentication: all 25 entries carry routes.
#[derive(Debug, Default)]
pub struct NullAuthHandler;

impl NullAuthHandler {
    pub fn authenticate_inbound(
        &mut self,
        packet: &[u8],
        _src: Ipv4Addr,
        _new_peer: bool,
    ) -> Result<InboundEntries, AuthError> {
        let n_entries = check_shape(packet, MAX_PACKET_BYTES, MIN_PACKET_BYTES)?;
        if n_entries == 0 {
            return Ok(entries_or_empty(0, 0));
        }
        // a pass-through port must not accept in-band auth data
        let af = u16::from_be_bytes([packet[HEADER_BYTES], packet[HEADER_BYTES + 1]]);
        if af == ADDR_FAMILY_AUTH {
            let auth_type = u16::from_be_bytes([packet[HEADER_BYTES + 2], packet[HEADER_BYTES + 3]]);
            return Err(PacketError::UnexpectedAuthEntry(auth_type).into());
        }
        Ok(entries_or_empty(HEADER_BYTES, n_entries))
    }

    pub fn authenticate_outbound(
        &mut self,
        packet: &RipPacket<Ipv4Addr>,
    ) -> Result<(Vec<RipPacket<Ipv4Addr>>, usize), AuthError> {
        let n_routes = packet.entry_count();
        Ok((vec![packet.clone()], n_routes))
    }
}

// ---------------------------------------------------------------------------
// Plaintext

/// RFC 2453 §4.1 simple password: the first entry carries 16 bytes of
/// password, leaving 24 route entries.
#[derive(Debug, Default)]
pub struct PlaintextAuthHandler {
    key: [u8; KEY_BYTES],
}

impl PlaintextAuthHandler {
    pub fn new(password: &str) -> PlaintextAuthHandler {
        let mut handler = PlaintextAuthHandler::default();
        handler.set_key(password);
        handler
    }

    /// Install the password, truncated or zero-padded to 16 bytes.
    pub fn set_key(&mut self, password: &str) {
        self.key = pad_key(password);
    }

    pub fn key(&self) -> &[u8; KEY_BYTES] {
        &self.key
    }

    pub fn authenticate_inbound(
        &mut self,
        packet: &[u8],
        _src: Ipv4Addr,
        _new_peer: bool,
    ) -> Result<InboundEntries, AuthError> {
        let n_entries = check_shape(packet, MAX_PACKET_BYTES, MIN_AUTH_PACKET_BYTES)?;

        let entry = &packet[HEADER_BYTES..HEADER_BYTES + ENTRY_BYTES];
        let af = u16::from_be_bytes([entry[0], entry[1]]);
        let auth_type = u16::from_be_bytes([entry[2], entry[3]]);
        if af != ADDR_FAMILY_AUTH || auth_type != AUTH_TYPE_PLAINTEXT {
            return Err(AuthError::AuthTypeMismatch {
                expected: AUTH_TYPE_PLAINTEXT,
                got: if af != ADDR_FAMILY_AUTH { af } else { auth_type },
            });
        }
        if entry[4..20] != self.key {
            return Err(AuthError::WrongPassword);
        }

        let n_routes = n_entries - 1;
        Ok(entries_or_empty(
            if n_routes == 0 {
                0
            } else {
                HEADER_BYTES + ENTRY_BYTES
            },
            n_routes,
        ))
    }

    pub fn authenticate_outbound(
        &mut self,
        packet: &RipPacket<Ipv4Addr>,
    ) -> Result<(Vec<RipPacket<Ipv4Addr>>, usize), AuthError> {
        let mut copy = packet.clone();
        let entry = copy
            .entry_bytes_mut(0)
            .ok_or(PacketError::PacketTooSmall(packet.data_bytes()))?;
        entry[0..2].copy_from_slice(&ADDR_FAMILY_AUTH.to_be_bytes());
        entry[2..4].copy_from_slice(&AUTH_TYPE_PLAINTEXT.to_be_bytes());
        entry[4..20].copy_from_slice(&self.key);
        let n_routes = copy.entry_count() - 1;
        Ok((vec![copy], n_routes))
    }
}

fn pad_key(password: &str) -> [u8; KEY_BYTES] {
    let mut key = [0u8; KEY_BYTES];
    let bytes = password.as_bytes();
    let n = bytes.len().min(KEY_BYTES);
    key[..n].copy_from_slice(&bytes[..n]);
    key
}

// ---------------------------------------------------------------------------
// MD5 keychain

/// One keyed-MD5 key with its validity window and replay state.
pub struct Md5Key {
    id: u8,
    key_data: [u8; KEY_BYTES],
    start: TimeVal,
    end: TimeVal,
    persistent: bool,
    o_seqno: u32,
    lr_seqno: HashMap<Ipv4Addr, u32>,
    pkts_recv: HashSet<Ipv4Addr>,
    // dropping the handles would unschedule the validity transitions
    _start_timer: Option<Timer>,
    _end_timer: Option<Timer>,
}

impl Md5Key {
    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn key_data(&self) -> &[u8; KEY_BYTES] {
        &self.key_data
    }

    pub fn start(&self) -> TimeVal {
        self.start
    }

    pub fn end(&self) -> TimeVal {
        self.end
    }

    /// Persistent keys survive their end time until replaced or removed
    /// (last-key rule).
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn valid_at(&self, when: TimeVal) -> bool {
        self.persistent || (self.start <= when && when <= self.end)
    }

    fn next_seqno_out(&mut self) -> u32 {
        let seqno = self.o_seqno;
        self.o_seqno = self.o_seqno.wrapping_add(1);
        seqno
    }

    fn packets_received(&self, src: &Ipv4Addr) -> bool {
        self.pkts_recv.contains(src)
    }

    fn last_seqno_recv(&self, src: &Ipv4Addr) -> u32 {
        self.lr_seqno.get(src).copied().unwrap_or(0)
    }

    fn set_last_seqno_recv(&mut self, src: Ipv4Addr, seqno: u32) {
        self.lr_seqno.insert(src, seqno);
        self.pkts_recv.insert(src);
    }

    fn reset_src(&mut self, src: &Ipv4Addr) {
        self.lr_seqno.remove(src);
        self.pkts_recv.remove(src);
    }

    fn reset(&mut self) {
        self.lr_seqno.clear();
        self.pkts_recv.clear();
    }
}

#[derive(Default)]
struct KeyChain {
    valid: Vec<Md5Key>,
    invalid: Vec<Md5Key>,
}

impl KeyChain {
    fn remove_key(&mut self, key_id: u8) -> bool {
        let valid_before = self.valid.len();
        self.valid.retain(|k| k.id != key_id);
        if self.valid.len() != valid_before {
            return true;
        }
        let invalid_before = self.invalid.len();
        self.invalid.retain(|k| k.id != key_id);
        self.invalid.len() != invalid_before
    }

    fn key_started(&mut self, key_id: u8) {
        if let Some(pos) = self.invalid.iter().position(|k| k.id == key_id) {
            let key = self.invalid.remove(pos);
            self.valid.push(key);
        }
    }

    fn key_stopped(&mut self, key_id: u8) {
        let Some(pos) = self.valid.iter().position(|k| k.id == key_id) else {
            return;
        };
        if self.valid.len() == 1 {
            // RFC 2082 §4.3: keep using the last key until its lifetime
            // is extended, it is deleted, or a new key is configured
            log::warn!(
                "last authentication key (key ID {key_id}) has expired; \
                 retaining it until it is replaced or deleted"
            );
            self.valid[pos].persistent = true;
            return;
        }
        let key = self.valid.remove(pos);
        self.invalid.push(key);
    }
}

/// RFC 2082 keyed-MD5 with keychain management.
pub struct Md5AuthHandler {
    timers: TimerList,
    chain: Rc<RefCell<KeyChain>>,
    null: NullAuthHandler,
}

impl Md5AuthHandler {
    pub fn new(timers: TimerList) -> Md5AuthHandler {
        Md5AuthHandler {
            timers,
            chain: Rc::new(RefCell::new(KeyChain::default())),
            null: NullAuthHandler,
        }
    }

    /// Install a key valid in `[start, end]`.
    ///
    /// A start in the future parks the key in the invalid set behind a
    /// start timer; the end timer retires it, subject to the last-key
    /// persistence rule. `TimeVal::MAXIMUM` means no end.
    pub fn add_key(
        &mut self,
        key_id: u8,
        password: &str,
        start: TimeVal,
        end: TimeVal,
    ) -> Result<(), KeyError> {
        let now = self.timers.current_time();
        if start > end {
            return Err(KeyError::StartAfterEnd);
        }
        if end < now {
            return Err(KeyError::EndInPast);
        }

        let start_timer = if start > now {
            let chain = Rc::downgrade(&self.chain);
            Some(self.timers.new_oneoff_at(start, move || {
                chain_op(&chain, |c| c.key_started(key_id));
            }))
        } else {
            None
        };

        let end_timer = if end != TimeVal::MAXIMUM {
            let chain = Rc::downgrade(&self.chain);
            Some(self.timers.new_oneoff_at(end, move || {
                chain_op(&chain, |c| c.key_stopped(key_id));
            }))
        } else {
            None
        };

        let mut chain = self.chain.borrow_mut();

        // a persistent leftover yields to freshly configured key material
        if chain.valid.len() == 1 && chain.valid[0].persistent {
            let mut key = chain.valid.remove(0);
            key.persistent = false;
            chain.invalid.push(key);
        }

        chain.remove_key(key_id);

        let key = Md5Key {
            id: key_id,
            key_data: pad_key(password),
            start,
            end,
            persistent: false,
            o_seqno: 0,
            lr_seqno: HashMap::new(),
            pkts_recv: HashSet::new(),
            _start_timer: start_timer,
            _end_timer: end_timer,
        };
        if key.valid_at(now) {
            chain.valid.push(key);
        } else {
            chain.invalid.push(key);
        }
        Ok(())
    }

    pub fn remove_key(&mut self, key_id: u8) -> Result<(), KeyError> {
        if self.chain.borrow_mut().remove_key(key_id) {
            Ok(())
        } else {
            Err(KeyError::NoSuchKey)
        }
    }

    pub fn empty(&self) -> bool {
        let chain = self.chain.borrow();
        chain.valid.is_empty() && chain.invalid.is_empty()
    }

    pub fn valid_key_count(&self) -> usize {
        self.chain.borrow().valid.len()
    }

    pub fn invalid_key_count(&self) -> usize {
        self.chain.borrow().invalid.len()
    }

    /// Ids of the currently valid keys, in configuration order.
    pub fn valid_key_ids(&self) -> Vec<u8> {
        self.chain.borrow().valid.iter().map(|k| k.id).collect()
    }

    pub fn reset(&mut self) {
        for key in self.chain.borrow_mut().valid.iter_mut() {
            key.reset();
        }
    }

    fn has_valid_keys(&self) -> bool {
        !self.chain.borrow().valid.is_empty()
    }

    pub fn authenticate_inbound(
        &mut self,
        packet: &[u8],
        src: Ipv4Addr,
        new_peer: bool,
    ) -> Result<InboundEntries, AuthError> {
        if !self.has_valid_keys() {
            return self.null.authenticate_inbound(packet, src, new_peer);
        }

        check_shape(
            packet,
            MAX_PACKET_BYTES + MD5_TRAILER_BYTES,
            MIN_AUTH_PACKET_BYTES,
        )?;

        let entry = &packet[HEADER_BYTES..HEADER_BYTES + ENTRY_BYTES];
        let af = u16::from_be_bytes([entry[0], entry[1]]);
        let auth_type = u16::from_be_bytes([entry[2], entry[3]]);
        if af != ADDR_FAMILY_AUTH || auth_type != AUTH_TYPE_MD5 {
            return Err(AuthError::AuthTypeMismatch {
                expected: AUTH_TYPE_MD5,
                got: if af != ADDR_FAMILY_AUTH { af } else { auth_type },
            });
        }

        let auth_offset = u16::from_be_bytes([entry[4], entry[5]]);
        let key_id = entry[6];
        let auth_bytes = entry[7];
        let seqno = u32::from_be_bytes([entry[8], entry[9], entry[10], entry[11]]);

        if usize::from(auth_bytes) != MD5_TRAILER_BYTES {
            return Err(AuthError::WrongAuthBytes(auth_bytes));
        }
        if usize::from(auth_offset) + usize::from(auth_bytes) != packet.len() {
            return Err(AuthError::BadAuthOffset {
                offset: auth_offset,
                bytes: auth_bytes,
                packet: packet.len(),
            });
        }

        let mut chain = self.chain.borrow_mut();
        let key = chain
            .valid
            .iter_mut()
            .find(|k| k.id == key_id)
            .ok_or(AuthError::BadKeyId(key_id))?;

        if new_peer {
            key.reset_src(&src);
        }

        let last_seqno = key.last_seqno_recv(&src);
        if key.packets_received(&src)
            && !(new_peer && seqno == 0)
            && seqno.wrapping_sub(last_seqno) >= 0x7fff_ffff
        {
            return Err(AuthError::ReplaySeqno {
                seqno,
                last: last_seqno,
            });
        }

        let trailer_start = usize::from(auth_offset);
        let trailer = &packet[trailer_start..];
        if trailer[0..2] != [0xff, 0xff] || trailer[2..4] != [0x00, 0x01] {
            return Err(AuthError::InvalidTrailer);
        }

        let mut ctx = Md5::new();
        ctx.update(&packet[..trailer_start + MD5_TRAILER_DIGEST_OFFSET]);
        ctx.update(key.key_data());
        let digest = ctx.finalize();
        if digest[..] != trailer[MD5_TRAILER_DIGEST_OFFSET..MD5_TRAILER_BYTES] {
            return Err(AuthError::DigestMismatch { key_id });
        }

        // only a digest-verified packet may advance the replay window
        key.set_last_seqno_recv(src, seqno);

        let n_entries = (trailer_start - HEADER_BYTES) / ENTRY_BYTES - 1;
        Ok(entries_or_empty(
            if n_entries == 0 {
                0
            } else {
                HEADER_BYTES + ENTRY_BYTES
            },
            n_entries,
        ))
    }

    /// Produce one authenticated copy of `packet` per valid key.
    pub fn authenticate_outbound(
        &mut self,
        packet: &RipPacket<Ipv4Addr>,
    ) -> Result<(Vec<RipPacket<Ipv4Addr>>, usize), AuthError> {
        if !self.has_valid_keys() {
            return self.null.authenticate_outbound(packet);
        }

        let mut out = Vec::new();
        let mut chain = self.chain.borrow_mut();
        for key in chain.valid.iter_mut() {
            let mut copy = packet.clone();
            let auth_offset = copy.data_bytes() as u16;
            let seqno = key.next_seqno_out();
            let entry = copy
                .entry_bytes_mut(0)
                .ok_or(PacketError::PacketTooSmall(packet.data_bytes()))?;
            entry[0..2].copy_from_slice(&ADDR_FAMILY_AUTH.to_be_bytes());
            entry[2..4].copy_from_slice(&AUTH_TYPE_MD5.to_be_bytes());
            entry[4..6].copy_from_slice(&auth_offset.to_be_bytes());
            entry[6] = key.id();
            entry[7] = MD5_TRAILER_BYTES as u8;
            entry[8..12].copy_from_slice(&seqno.to_be_bytes());
            entry[12..20].fill(0);

            let mut trailer = [0u8; MD5_TRAILER_BYTES];
            trailer[0..2].copy_from_slice(&[0xff, 0xff]);
            trailer[2..4].copy_from_slice(&[0x00, 0x01]);

            let mut ctx = Md5::new();
            ctx.update(copy.data());
            ctx.update(&trailer[..MD5_TRAILER_DIGEST_OFFSET]);
            ctx.update(key.key_data());
            trailer[MD5_TRAILER_DIGEST_OFFSET..].copy_from_slice(&ctx.finalize());

            copy.append_data(&trailer);
            out.push(copy);
        }

        let n_routes = (packet.data_bytes() - HEADER_BYTES) / ENTRY_BYTES - 1;
        Ok((out, n_routes))
    }
}

fn chain_op<F>(chain: &Weak<RefCell<KeyChain>>, op: F)
where
    F: FnOnce(&mut KeyChain),
{
    if let Some(chain) = chain.upgrade() {
        op(&mut chain.borrow_mut());
    }
}

// ---------------------------------------------------------------------------
// The runtime-selectable strategy

/// The authentication strategy configured on a port.
pub enum AuthHandler {
    None(NullAuthHandler),
    Plaintext(PlaintextAuthHandler),
    Md5(Md5AuthHandler),
}

impl AuthHandler {
    pub fn none() -> AuthHandler {
        AuthHandler::None(NullAuthHandler)
    }

    pub fn plaintext(password: &str) -> AuthHandler {
        AuthHandler::Plaintext(PlaintextAuthHandler::new(password))
    }

    pub fn md5(timers: TimerList) -> AuthHandler {
        AuthHandler::Md5(Md5AuthHandler::new(timers))
    }

    /// The scheme actually in effect; an MD5 handler with no valid keys
    /// reports (and behaves as) "none".
    pub fn effective_name(&self) -> &'static str {
        match self {
            AuthHandler::None(_) => "none",
            AuthHandler::Plaintext(_) => "simple",
            AuthHandler::Md5(md5) => {
                if md5.has_valid_keys() {
                    "md5"
                } else {
                    "none"
                }
            }
        }
    }

    /// Entries at the front of each packet consumed by authentication.
    pub fn head_entries(&self) -> usize {
        match self {
            AuthHandler::None(_) => 0,
            AuthHandler::Plaintext(_) => 1,
            AuthHandler::Md5(md5) => {
                if md5.has_valid_keys() {
                    1
                } else {
                    0
                }
            }
        }
    }

    /// Routing entries a single packet can carry under this scheme.
    pub fn max_routing_entries(&self) -> usize {
        crate::constants::RIPV2_ROUTES_PER_PACKET - self.head_entries()
    }

    /// Drop per-source replay state (MD5 only).
    pub fn reset(&mut self) {
        if let AuthHandler::Md5(md5) = self {
            md5.reset();
        }
    }

    pub fn authenticate_inbound(
        &mut self,
        packet: &[u8],
        src: Ipv4Addr,
        new_peer: bool,
    ) -> Result<InboundEntries, AuthError> {
        match self {
            AuthHandler::None(h) => h.authenticate_inbound(packet, src, new_peer),
            AuthHandler::Plaintext(h) => h.authenticate_inbound(packet, src, new_peer),
            AuthHandler::Md5(h) => h.authenticate_inbound(packet, src, new_peer),
        }
    }

    pub fn authenticate_outbound(
        &mut self,
        packet: &RipPacket<Ipv4Addr>,
    ) -> Result<(Vec<RipPacket<Ipv4Addr>>, usize), AuthError> {
        match self {
            AuthHandler::None(h) => h.authenticate_outbound(packet),
            AuthHandler::Plaintext(h) => h.authenticate_outbound(packet),
            AuthHandler::Md5(h) => h.authenticate_outbound(packet),
        }
    }
}
