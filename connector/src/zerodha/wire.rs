//! Framed binary market-data decoder.
//!
//! The feed packs multiple packets into one binary WebSocket frame, all
//! big-endian:
//!
//! ```text
//! [ u16 packet_count ] { [ u16 packet_len ] [ packet_len bytes ] }*
//! ```
//!
//! Packet kinds are dispatched on length after the 4-byte instrument token:
//! 8 bytes is LTP, 44 is QUOTE, 184 is FULL (QUOTE plus timestamps, open
//! interest and five aggregated depth levels per side). Tokens inside the
//! venue's reserved index range decode as INDEX records regardless of
//! length. Prices are carried in paise, which is already the canonical
//! fixed-point unit, so no scaling happens here.

use thiserror::Error;
use tracing::warn;

use tradecore::types::{Price, Qty};

pub const DEPTH_LEVELS: usize = 5;

pub const LTP_PACKET_LEN: usize = 8;
pub const QUOTE_PACKET_LEN: usize = 44;
pub const FULL_PACKET_LEN: usize = 184;
pub const INDEX_PACKET_MIN_LEN: usize = 28;

/// Tokens in this range belong to the venue's index feed. The instrument
/// cache is the authoritative source at subscription time; this range only
/// drives wire-level dispatch.
pub const INDEX_TOKEN_MIN: u32 = 100_000;
pub const INDEX_TOKEN_MAX: u32 = 300_000;

#[derive(Error, Debug, Eq, PartialEq)]
pub enum DecodeError {
    #[error("ShortFrame: need {need} bytes, {have} remain")]
    ShortFrame { need: usize, have: usize },
    #[error("UnknownPacket: length {0}")]
    UnknownPacket(usize),
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DepthEntry {
    pub qty: Qty,
    pub price: Price,
    pub orders: u16,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct QuoteFields {
    pub last_price: Price,
    pub last_qty: Qty,
    pub avg_price: Price,
    pub volume: Qty,
    pub buy_qty: Qty,
    pub sell_qty: Qty,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TickPacket {
    Ltp {
        token: u32,
        last_price: Price,
    },
    Quote {
        token: u32,
        quote: QuoteFields,
    },
    Full {
        token: u32,
        quote: QuoteFields,
        last_trade_time: i64,
        open_interest: i64,
        oi_day_high: i64,
        oi_day_low: i64,
        exchange_ts: i64,
        bids: [DepthEntry; DEPTH_LEVELS],
        asks: [DepthEntry; DEPTH_LEVELS],
    },
    Index {
        token: u32,
        last_price: Price,
        high: Price,
        low: Price,
        open: Price,
        close: Price,
        exchange_ts: Option<i64>,
    },
}

impl TickPacket {
    pub fn token(&self) -> u32 {
        match self {
            TickPacket::Ltp { token, .. }
            | TickPacket::Quote { token, .. }
            | TickPacket::Full { token, .. }
            | TickPacket::Index { token, .. } => *token,
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::ShortFrame {
                need: n,
                have: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn i16(&mut self) -> Result<i16, DecodeError> {
        Ok(self.u16()? as i16)
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.u32()? as i32)
    }
}

/// Decodes one binary frame. Packets decoded before a truncation are
/// retained; the truncation itself is reported alongside them. A packet of
/// unrecognized length is logged and skipped without aborting the frame.
pub fn decode_frame(payload: &[u8]) -> (Vec<TickPacket>, Option<DecodeError>) {
    let mut cursor = Cursor::new(payload);
    let mut packets = Vec::new();

    let count = match cursor.u16() {
        Ok(count) => count,
        Err(error) => return (packets, Some(error)),
    };

    for _ in 0..count {
        let len = match cursor.u16() {
            Ok(len) => len as usize,
            Err(error) => return (packets, Some(error)),
        };
        let body = match cursor.take(len) {
            Ok(body) => body,
            Err(error) => return (packets, Some(error)),
        };
        match decode_packet(body) {
            Ok(packet) => packets.push(packet),
            Err(error @ DecodeError::UnknownPacket(_)) => {
                warn!(?error, len, "skipping unknown packet");
            }
            Err(error) => return (packets, Some(error)),
        }
    }

    (packets, None)
}

fn decode_packet(body: &[u8]) -> Result<TickPacket, DecodeError> {
    let mut cursor = Cursor::new(body);
    let token = cursor.u32()?;

    if (INDEX_TOKEN_MIN..=INDEX_TOKEN_MAX).contains(&token) {
        if body.len() < INDEX_PACKET_MIN_LEN {
            return Err(DecodeError::UnknownPacket(body.len()));
        }
        let last_price = cursor.i32()? as Price;
        let high = cursor.i32()? as Price;
        let low = cursor.i32()? as Price;
        let open = cursor.i32()? as Price;
        let close = cursor.i32()? as Price;
        // Net-change field precedes the optional timestamp.
        let _change = cursor.i32()?;
        let exchange_ts = if body.len() >= 32 {
            Some(cursor.i32()? as i64)
        } else {
            None
        };
        return Ok(TickPacket::Index {
            token,
            last_price,
            high,
            low,
            open,
            close,
            exchange_ts,
        });
    }

    match body.len() {
        LTP_PACKET_LEN => Ok(TickPacket::Ltp {
            token,
            last_price: cursor.i32()? as Price,
        }),
        QUOTE_PACKET_LEN => Ok(TickPacket::Quote {
            token,
            quote: decode_quote(&mut cursor)?,
        }),
        FULL_PACKET_LEN => {
            let quote = decode_quote(&mut cursor)?;
            let last_trade_time = cursor.i32()? as i64;
            let open_interest = cursor.i32()? as i64;
            let oi_day_high = cursor.i32()? as i64;
            let oi_day_low = cursor.i32()? as i64;
            let exchange_ts = cursor.i32()? as i64;
            let bids = decode_depth(&mut cursor)?;
            let asks = decode_depth(&mut cursor)?;
            Ok(TickPacket::Full {
                token,
                quote,
                last_trade_time,
                open_interest,
                oi_day_high,
                oi_day_low,
                exchange_ts,
                bids,
                asks,
            })
        }
        len => Err(DecodeError::UnknownPacket(len)),
    }
}

fn decode_quote(cursor: &mut Cursor) -> Result<QuoteFields, DecodeError> {
    Ok(QuoteFields {
        last_price: cursor.i32()? as Price,
        last_qty: cursor.i32()? as Qty,
        avg_price: cursor.i32()? as Price,
        volume: cursor.i32()? as Qty,
        buy_qty: cursor.i32()? as Qty,
        sell_qty: cursor.i32()? as Qty,
        open: cursor.i32()? as Price,
        high: cursor.i32()? as Price,
        low: cursor.i32()? as Price,
        close: cursor.i32()? as Price,
    })
}

fn decode_depth(cursor: &mut Cursor) -> Result<[DepthEntry; DEPTH_LEVELS], DecodeError> {
    let mut entries = [DepthEntry::default(); DEPTH_LEVELS];
    for entry in &mut entries {
        let qty = cursor.i32()? as Qty;
        let price = cursor.i32()? as Price;
        let orders = cursor.i16()? as u16;
        let _padding = cursor.i16()?;
        *entry = DepthEntry { qty, price, orders };
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference encoder: mirrors the decoder for byte-exact round trips.
    // Reserved padding always encodes as zero.
    fn put_i32(buf: &mut Vec<u8>, v: i64) {
        buf.extend_from_slice(&(v as i32).to_be_bytes());
    }

    fn encode_quote(buf: &mut Vec<u8>, q: &QuoteFields) {
        for v in [
            q.last_price,
            q.last_qty,
            q.avg_price,
            q.volume,
            q.buy_qty,
            q.sell_qty,
            q.open,
            q.high,
            q.low,
            q.close,
        ] {
            put_i32(buf, v);
        }
    }

    fn encode_packet(packet: &TickPacket) -> Vec<u8> {
        let mut buf = Vec::new();
        match packet {
            TickPacket::Ltp { token, last_price } => {
                buf.extend_from_slice(&token.to_be_bytes());
                put_i32(&mut buf, *last_price);
            }
            TickPacket::Quote { token, quote } => {
                buf.extend_from_slice(&token.to_be_bytes());
                encode_quote(&mut buf, quote);
            }
            TickPacket::Full {
                token,
                quote,
                last_trade_time,
                open_interest,
                oi_day_high,
                oi_day_low,
                exchange_ts,
                bids,
                asks,
            } => {
                buf.extend_from_slice(&token.to_be_bytes());
                encode_quote(&mut buf, quote);
                for v in [
                    *last_trade_time,
                    *open_interest,
                    *oi_day_high,
                    *oi_day_low,
                    *exchange_ts,
                ] {
                    put_i32(&mut buf, v);
                }
                for entry in bids.iter().chain(asks.iter()) {
                    put_i32(&mut buf, entry.qty);
                    put_i32(&mut buf, entry.price);
                    buf.extend_from_slice(&entry.orders.to_be_bytes());
                    buf.extend_from_slice(&[0, 0]);
                }
            }
            TickPacket::Index {
                token,
                last_price,
                high,
                low,
                open,
                close,
                exchange_ts,
            } => {
                buf.extend_from_slice(&token.to_be_bytes());
                for v in [*last_price, *high, *low, *open, *close, 0] {
                    put_i32(&mut buf, v);
                }
                if let Some(ts) = exchange_ts {
                    put_i32(&mut buf, *ts);
                }
            }
        }
        buf
    }

    fn encode_frame(packets: &[TickPacket]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&(packets.len() as u16).to_be_bytes());
        for packet in packets {
            let body = encode_packet(packet);
            frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
            frame.extend_from_slice(&body);
        }
        frame
    }

    fn sample_full() -> TickPacket {
        let mut bids = [DepthEntry::default(); DEPTH_LEVELS];
        let mut asks = [DepthEntry::default(); DEPTH_LEVELS];
        bids[0] = DepthEntry {
            qty: 5,
            price: 10000,
            orders: 1,
        };
        bids[1] = DepthEntry {
            qty: 3,
            price: 9995,
            orders: 1,
        };
        asks[0] = DepthEntry {
            qty: 4,
            price: 10010,
            orders: 1,
        };
        asks[1] = DepthEntry {
            qty: 2,
            price: 10015,
            orders: 1,
        };
        TickPacket::Full {
            token: 738_561,
            quote: QuoteFields {
                last_price: 10005,
                last_qty: 10,
                avg_price: 10002,
                volume: 125_000,
                buy_qty: 600,
                sell_qty: 480,
                open: 9990,
                high: 10040,
                low: 9950,
                close: 9985,
            },
            last_trade_time: 1_700_000_000,
            open_interest: 0,
            oi_day_high: 0,
            oi_day_low: 0,
            exchange_ts: 1_700_000_001,
            bids,
            asks,
        }
    }

    #[test]
    fn round_trips_all_packet_kinds() {
        let packets = vec![
            TickPacket::Ltp {
                token: 408_065,
                last_price: 254_550,
            },
            sample_full(),
            TickPacket::Index {
                token: 256_265,
                last_price: 2_254_550,
                high: 2_260_000,
                low: 2_240_000,
                open: 2_248_000,
                close: 2_251_000,
                exchange_ts: Some(1_700_000_002),
            },
        ];
        let frame = encode_frame(&packets);
        let (decoded, error) = decode_frame(&frame);
        assert_eq!(error, None);
        assert_eq!(decoded, packets);
        // Decode-encode identity over the captured bytes.
        assert_eq!(encode_frame(&decoded), frame);
    }

    #[test]
    fn quote_packet_is_44_bytes() {
        let packet = TickPacket::Quote {
            token: 738_561,
            quote: QuoteFields {
                last_price: 10005,
                last_qty: 10,
                avg_price: 10002,
                volume: 125_000,
                buy_qty: 600,
                sell_qty: 480,
                open: 9990,
                high: 10040,
                low: 9950,
                close: 9985,
            },
        };
        let body = encode_packet(&packet);
        assert_eq!(body.len(), QUOTE_PACKET_LEN);
        let (decoded, error) = decode_frame(&encode_frame(&[packet]));
        assert_eq!(error, None);
        assert_eq!(decoded, vec![packet]);
    }

    #[test]
    fn short_frame_keeps_decoded_prefix() {
        let ltp = TickPacket::Ltp {
            token: 1,
            last_price: 100,
        };
        let mut frame = encode_frame(&[ltp, ltp]);
        frame.truncate(frame.len() - 4);
        let (decoded, error) = decode_frame(&frame);
        assert_eq!(decoded, vec![ltp]);
        assert!(matches!(error, Some(DecodeError::ShortFrame { .. })));
    }

    #[test]
    fn empty_payload_is_short() {
        let (decoded, error) = decode_frame(&[0x01]);
        assert!(decoded.is_empty());
        assert!(matches!(error, Some(DecodeError::ShortFrame { .. })));
    }

    #[test]
    fn unknown_length_skips_only_that_packet() {
        let ltp = TickPacket::Ltp {
            token: 2,
            last_price: 321,
        };
        // A 12-byte packet matches no known kind.
        let mut frame = Vec::new();
        frame.extend_from_slice(&2u16.to_be_bytes());
        frame.extend_from_slice(&12u16.to_be_bytes());
        frame.extend_from_slice(&[0u8; 12]);
        let body = encode_packet(&ltp);
        frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
        frame.extend_from_slice(&body);

        let (decoded, error) = decode_frame(&frame);
        assert_eq!(error, None);
        assert_eq!(decoded, vec![ltp]);
    }

    #[test]
    fn index_without_timestamp() {
        let packet = TickPacket::Index {
            token: 256_265,
            last_price: 100,
            high: 110,
            low: 90,
            open: 95,
            close: 98,
            exchange_ts: None,
        };
        let body = encode_packet(&packet);
        assert_eq!(body.len(), INDEX_PACKET_MIN_LEN);
        let (decoded, error) = decode_frame(&encode_frame(&[packet]));
        assert_eq!(error, None);
        assert_eq!(decoded, vec![packet]);
    }
}
