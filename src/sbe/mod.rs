//! Simple Binary Encoding decoder for the four market-data templates.
//!
//! Bounds-checked cursor reads over a borrowed byte slice; no panics on
//! adversarial input, and a `thiserror` error enum for anything malformed.

use thiserror::Error;

pub const SCHEMA_ID: u16 = 3;
pub const SUPPORTED_VERSIONS: [u16; 2] = [1, 2];

const TEMPLATE_TRADES: u16 = 10000;
const TEMPLATE_BEST_BID_ASK: u16 = 10001;
const TEMPLATE_DEPTH_SNAPSHOT: u16 = 10002;
const TEMPLATE_DEPTH_DIFF: u16 = 10003;

/// Sentinel mantissa denoting an absent optional quantity field.
pub const ABSENT_MANTISSA: i64 = i64::MAX;

#[derive(Error, Debug, PartialEq)]
pub enum SbeError {
    #[error("buffer truncated: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },
    #[error("unsupported schema id {0}")]
    UnsupportedSchema(u16),
    #[error("unsupported schema version {0}")]
    UnsupportedVersion(u16),
    #[error("unknown template id {0}")]
    UnknownTemplate(u16),
    #[error("invalid symbol bytes: {0}")]
    InvalidSymbol(String),
    #[error("inconsistent group length")]
    InconsistentLength,
}

type Result<T> = std::result::Result<T, SbeError>;

/// A bounds-checked little-endian cursor over a byte buffer.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.pos + n > self.buf.len() {
            Err(SbeError::Truncated {
                needed: self.pos + n,
                available: self.buf.len(),
            })
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn i8(&mut self) -> Result<i8> {
        Ok(self.u8()? as i8)
    }

    fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        let v = u16::from_le_bytes(self.buf[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        let v = u64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(self.u64()? as i64)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    /// A `u8` length prefix followed by that many UTF-8 bytes.
    fn symbol(&mut self) -> Result<String> {
        let len = self.u8()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|e| SbeError::InvalidSymbol(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    pub block_length: u16,
    pub template_id: u16,
    pub schema_id: u16,
    pub version: u16,
}

/// `value = mantissa * 10^exponent`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decimal {
    pub mantissa: i64,
    pub exponent: i8,
}

impl Decimal {
    pub fn to_f64(self) -> f64 {
        self.mantissa as f64 * 10f64.powi(self.exponent as i32)
    }
}

/// An optional quantity, distinguished at the decoder from an always-present
/// price. Absent is carried as its own variant, not silently as NaN, so
/// consumers cannot mistake it for a decode failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptionalQty {
    Present(f64),
    Absent,
}

impl OptionalQty {
    fn from_mantissa(mantissa: i64, exponent: i8) -> Self {
        if mantissa == ABSENT_MANTISSA {
            OptionalQty::Absent
        } else {
            OptionalQty::Present(Decimal { mantissa, exponent }.to_f64())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeRecord {
    pub trade_id: i64,
    pub price: f64,
    pub quantity: f64,
    pub buyer_is_maker: bool,
    /// Constant `true` per schema; never present on the wire.
    pub is_best_match: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trades {
    pub event_time_us: u64,
    pub transact_time_us: u64,
    pub symbol: String,
    pub trades: Vec<TradeRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BestBidAsk {
    pub event_time_us: u64,
    pub book_update_id: i64,
    pub symbol: String,
    pub bid_price: f64,
    pub bid_qty: OptionalQty,
    pub ask_price: f64,
    pub ask_qty: OptionalQty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepthLevel {
    pub price: f64,
    pub qty: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepthSnapshot {
    pub event_time_us: u64,
    pub book_update_id: i64,
    pub symbol: String,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepthChange {
    pub price: f64,
    pub qty: OptionalQty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepthDiff {
    pub event_time_us: u64,
    pub first_update_id: i64,
    pub last_update_id: i64,
    pub symbol: String,
    pub bids: Vec<DepthChange>,
    pub asks: Vec<DepthChange>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SbeMessage {
    Trades(Trades),
    BestBidAsk(BestBidAsk),
    DepthSnapshot(DepthSnapshot),
    DepthDiff(DepthDiff),
}

fn read_header(cur: &mut Cursor) -> Result<Header> {
    let header = Header {
        block_length: cur.u16()?,
        template_id: cur.u16()?,
        schema_id: cur.u16()?,
        version: cur.u16()?,
    };
    if header.schema_id != SCHEMA_ID {
        return Err(SbeError::UnsupportedSchema(header.schema_id));
    }
    if !SUPPORTED_VERSIONS.contains(&header.version) {
        return Err(SbeError::UnsupportedVersion(header.version));
    }
    Ok(header)
}

/// Reads a repeating group's block-length + count prefix. `count_width` is
/// 4 bytes for trades, 2 bytes for depth groups, per the schema.
fn read_group_prefix(cur: &mut Cursor, count_is_u32: bool) -> Result<(u16, u32)> {
    let block_length = cur.u16()?;
    let count = if count_is_u32 { cur.u32()? } else { cur.u16()? as u32 };
    Ok((block_length, count))
}

fn decode_trades(cur: &mut Cursor) -> Result<Trades> {
    let event_time_us = cur.u64()?;
    let transact_time_us = cur.u64()?;
    let price_exponent = cur.i8()?;
    let qty_exponent = cur.i8()?;

    let (record_len, count) = read_group_prefix(cur, true)?;
    let mut trades = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let start = cur.pos;
        let trade_id = cur.i64()?;
        let price_mantissa = cur.i64()?;
        let qty_mantissa = cur.i64()?;
        let buyer_is_maker = cur.u8()? != 0;
        if cur.pos - start != record_len as usize {
            return Err(SbeError::InconsistentLength);
        }
        trades.push(TradeRecord {
            trade_id,
            price: Decimal {
                mantissa: price_mantissa,
                exponent: price_exponent,
            }
            .to_f64(),
            quantity: Decimal {
                mantissa: qty_mantissa,
                exponent: qty_exponent,
            }
            .to_f64(),
            buyer_is_maker,
            is_best_match: true,
        });
    }

    let symbol = cur.symbol()?;
    Ok(Trades {
        event_time_us,
        transact_time_us,
        symbol,
        trades,
    })
}

fn decode_best_bid_ask(cur: &mut Cursor) -> Result<BestBidAsk> {
    let event_time_us = cur.u64()?;
    let book_update_id = cur.i64()?;
    let price_exponent = cur.i8()?;
    let qty_exponent = cur.i8()?;
    let bid_price_mantissa = cur.i64()?;
    let bid_qty_mantissa = cur.i64()?;
    let ask_price_mantissa = cur.i64()?;
    let ask_qty_mantissa = cur.i64()?;
    let symbol = cur.symbol()?;

    Ok(BestBidAsk {
        event_time_us,
        book_update_id,
        symbol,
        bid_price: Decimal {
            mantissa: bid_price_mantissa,
            exponent: price_exponent,
        }
        .to_f64(),
        bid_qty: OptionalQty::from_mantissa(bid_qty_mantissa, qty_exponent),
        ask_price: Decimal {
            mantissa: ask_price_mantissa,
            exponent: price_exponent,
        }
        .to_f64(),
        ask_qty: OptionalQty::from_mantissa(ask_qty_mantissa, qty_exponent),
    })
}

fn decode_depth_levels(
    cur: &mut Cursor,
    price_exponent: i8,
    qty_exponent: i8,
) -> Result<Vec<DepthLevel>> {
    let (record_len, count) = read_group_prefix(cur, false)?;
    let mut levels = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let start = cur.pos;
        let price_mantissa = cur.i64()?;
        let qty_mantissa = cur.i64()?;
        if cur.pos - start != record_len as usize {
            return Err(SbeError::InconsistentLength);
        }
        levels.push(DepthLevel {
            price: Decimal {
                mantissa: price_mantissa,
                exponent: price_exponent,
            }
            .to_f64(),
            qty: Decimal {
                mantissa: qty_mantissa,
                exponent: qty_exponent,
            }
            .to_f64(),
        });
    }
    Ok(levels)
}

fn decode_depth_snapshot(cur: &mut Cursor) -> Result<DepthSnapshot> {
    let event_time_us = cur.u64()?;
    let book_update_id = cur.i64()?;
    let price_exponent = cur.i8()?;
    let qty_exponent = cur.i8()?;
    let bids = decode_depth_levels(cur, price_exponent, qty_exponent)?;
    let asks = decode_depth_levels(cur, price_exponent, qty_exponent)?;
    let symbol = cur.symbol()?;
    Ok(DepthSnapshot {
        event_time_us,
        book_update_id,
        symbol,
        bids,
        asks,
    })
}

fn decode_depth_changes(
    cur: &mut Cursor,
    price_exponent: i8,
    qty_exponent: i8,
) -> Result<Vec<DepthChange>> {
    let (record_len, count) = read_group_prefix(cur, false)?;
    let mut changes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let start = cur.pos;
        let price_mantissa = cur.i64()?;
        let qty_mantissa = cur.i64()?;
        if cur.pos - start != record_len as usize {
            return Err(SbeError::InconsistentLength);
        }
        changes.push(DepthChange {
            price: Decimal {
                mantissa: price_mantissa,
                exponent: price_exponent,
            }
            .to_f64(),
            qty: OptionalQty::from_mantissa(qty_mantissa, qty_exponent),
        });
    }
    Ok(changes)
}

fn decode_depth_diff(cur: &mut Cursor) -> Result<DepthDiff> {
    let event_time_us = cur.u64()?;
    let first_update_id = cur.i64()?;
    let last_update_id = cur.i64()?;
    let price_exponent = cur.i8()?;
    let qty_exponent = cur.i8()?;
    let bids = decode_depth_changes(cur, price_exponent, qty_exponent)?;
    let asks = decode_depth_changes(cur, price_exponent, qty_exponent)?;
    let symbol = cur.symbol()?;
    Ok(DepthDiff {
        event_time_us,
        first_update_id,
        last_update_id,
        symbol,
        bids,
        asks,
    })
}

/// Reads the 8-byte header, dispatches on template id. Never panics on
/// adversarial input: every read is bounds-checked.
pub fn decode(buf: &[u8]) -> Result<SbeMessage> {
    let mut cur = Cursor::new(buf);
    let header = read_header(&mut cur)?;
    match header.template_id {
        TEMPLATE_TRADES => Ok(SbeMessage::Trades(decode_trades(&mut cur)?)),
        TEMPLATE_BEST_BID_ASK => Ok(SbeMessage::BestBidAsk(decode_best_bid_ask(&mut cur)?)),
        TEMPLATE_DEPTH_SNAPSHOT => Ok(SbeMessage::DepthSnapshot(decode_depth_snapshot(&mut cur)?)),
        TEMPLATE_DEPTH_DIFF => Ok(SbeMessage::DepthDiff(decode_depth_diff(&mut cur)?)),
        other => Err(SbeError::UnknownTemplate(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(template_id: u16) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&0u16.to_le_bytes()); // block_length unused by decoder
        b.extend_from_slice(&template_id.to_le_bytes());
        b.extend_from_slice(&SCHEMA_ID.to_le_bytes());
        b.extend_from_slice(&2u16.to_le_bytes());
        b
    }

    #[test]
    fn decode_best_bid_ask_with_absent_ask_quantity() {
        // absent/null quantity is encoded as i64::MAX
        let mut b = header_bytes(TEMPLATE_BEST_BID_ASK);
        b.extend_from_slice(&1u64.to_le_bytes()); // event_time_us
        b.extend_from_slice(&1i64.to_le_bytes()); // book_update_id
        b.push((-2i8) as u8); // price_exponent
        b.push((-5i8) as u8); // qty_exponent
        b.extend_from_slice(&9553554i64.to_le_bytes()); // bid_price_mantissa
        b.extend_from_slice(&123i64.to_le_bytes()); // bid_qty_mantissa
        b.extend_from_slice(&9553555i64.to_le_bytes()); // ask_price_mantissa
        b.extend_from_slice(&ABSENT_MANTISSA.to_le_bytes()); // ask_qty_mantissa: absent
        b.push(7); // symbol length
        b.extend_from_slice(b"BTCUSDT");

        let msg = decode(&b).unwrap();
        match msg {
            SbeMessage::BestBidAsk(bba) => {
                assert!((bba.bid_price - 95535.54).abs() < 1e-9);
                assert_eq!(bba.bid_qty, OptionalQty::Present(0.00123));
                assert!((bba.ask_price - 95535.55).abs() < 1e-9);
                assert_eq!(bba.ask_qty, OptionalQty::Absent);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn truncated_buffer_is_a_decode_error_not_a_panic() {
        let b = header_bytes(TEMPLATE_BEST_BID_ASK);
        assert!(matches!(decode(&b), Err(SbeError::Truncated { .. })));
    }

    #[test]
    fn unknown_template_id_is_rejected() {
        let b = header_bytes(65535);
        assert!(matches!(decode(&b), Err(SbeError::UnknownTemplate(65535))));
    }

    #[test]
    fn decode_trades_group_with_constant_is_best_match() {
        let mut b = header_bytes(TEMPLATE_TRADES);
        b.extend_from_slice(&1u64.to_le_bytes());
        b.extend_from_slice(&2u64.to_le_bytes());
        b.push((-2i8) as u8);
        b.push((-5i8) as u8);
        b.extend_from_slice(&17u16.to_le_bytes()); // record length: 8+8+8+1
        b.extend_from_slice(&1u32.to_le_bytes()); // count
        b.extend_from_slice(&42i64.to_le_bytes()); // trade_id
        b.extend_from_slice(&100i64.to_le_bytes()); // price mantissa
        b.extend_from_slice(&5i64.to_le_bytes()); // qty mantissa
        b.push(1); // buyer_is_maker
        b.push(3);
        b.extend_from_slice(b"ETH");

        let msg = decode(&b).unwrap();
        match msg {
            SbeMessage::Trades(t) => {
                assert_eq!(t.trades.len(), 1);
                assert!(t.trades[0].is_best_match);
                assert!(t.trades[0].buyer_is_maker);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
