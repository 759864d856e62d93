//! Registry mapping message type codes to parsers.

use std::collections::BTreeMap;

use crate::message::{
    decode_common_header, decode_hello, decode_hna, decode_mid, decode_tc, decode_unknown,
    CodecError, CommonHeader, Message, MESSAGE_HEADER_BYTES,
};
use crate::types::{
    HELLO_MESSAGE, HNA_MESSAGE, LQ_HELLO_MESSAGE, LQ_TC_MESSAGE, MID_MESSAGE, TC_MESSAGE,
};

type DecodeFn = Box<dyn Fn(&CommonHeader, &[u8]) -> Result<Message, CodecError>>;

/// Decoder registry for OLSR message types.
///
/// Unregistered type codes fall through to the opaque decoder so their
/// bytes survive for RFC-compliant forwarding; that path is deliberate
/// and cannot be unregistered.
pub struct MessageDecoder {
    by_type: BTreeMap<u8, DecodeFn>,
}

impl MessageDecoder {
    /// A registry with the standard RFC 3626 types plus the olsrd ETX
    /// variants.
    pub fn new() -> MessageDecoder {
        let mut decoder = MessageDecoder {
            by_type: BTreeMap::new(),
        };
        decoder.register(HELLO_MESSAGE, |h, body| decode_hello(h, body, false));
        decoder.register(LQ_HELLO_MESSAGE, |h, body| decode_hello(h, body, true));
        decoder.register(TC_MESSAGE, |h, body| decode_tc(h, body, false));
        decoder.register(LQ_TC_MESSAGE, |h, body| decode_tc(h, body, true));
        decoder.register(MID_MESSAGE, decode_mid);
        decoder.register(HNA_MESSAGE, decode_hna);
        decoder
    }

    /// An empty registry; every message decodes as opaque bytes.
    pub fn empty() -> MessageDecoder {
        MessageDecoder {
            by_type: BTreeMap::new(),
        }
    }

    /// Register (or replace) the parser for one type code.
    pub fn register<F>(&mut self, type_code: u8, decode: F)
    where
        F: Fn(&CommonHeader, &[u8]) -> Result<Message, CodecError> + 'static,
    {
        self.by_type.insert(type_code, Box::new(decode));
    }

    /// Decode one message from the front of `buf`.
    ///
    /// Returns the message and the number of bytes it occupied on the
    /// wire.
    pub fn decode(&self, buf: &[u8]) -> Result<(Message, usize), CodecError> {
        if buf.len() < MESSAGE_HEADER_BYTES {
            return Err(CodecError::InvalidMessage(format!(
                "message too short: {} bytes, need {}",
                buf.len(),
                MESSAGE_HEADER_BYTES
            )));
        }
        let header = decode_common_header(buf)?;
        let body = &buf[MESSAGE_HEADER_BYTES..header.size];
        let message = match self.by_type.get(&header.type_code) {
            Some(decode) => decode(&header, body)?,
            None => decode_unknown(&header, buf),
        };
        Ok((message, header.size))
    }
}

impl Default for MessageDecoder {
    fn default() -> Self {
        MessageDecoder::new()
    }
}
