//! Event layouts of the token and gateway contracts.

use std::str::FromStr;

use alloy::primitives::{Address, Bytes, FixedBytes, LogData, B256};
use alloy::sol;
use alloy::sol_types::SolEvent;
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{
    ChainEvent, OrderCreatedEvent, OrderRefundedEvent, OrderSettledEvent, TransferEvent,
};

sol! {
    #[allow(missing_docs)]
    #[derive(Debug)]
    interface IERC20 {
        event Transfer(address indexed from, address indexed to, uint256 value);
    }
}

sol! {
    #[allow(missing_docs)]
    #[allow(clippy::too_many_arguments)]
    #[derive(Debug)]
    interface IGateway {
        event OrderCreated(
            address indexed sender,
            address indexed token,
            uint256 indexed amount,
            uint256 protocolFee,
            bytes32 orderId,
            uint256 rate,
            bytes32 institutionCode,
            string messageHash
        );

        event OrderSettled(
            bytes32 splitOrderId,
            bytes32 indexed orderId,
            address indexed liquidityProvider,
            uint96 settlePercent
        );

        event OrderRefunded(uint256 fee, bytes32 indexed orderId);
    }
}

/// On-chain rates carry two implied decimals
pub const RATE_DECIMALS: u32 = 2;

/// `settlePercent` is expressed out of 100_000
pub const SETTLE_PERCENT_DECIMALS: u32 = 3;

/// Log as returned by either transport
#[derive(Debug, Clone)]
pub struct RawLog {
    pub address: Address,
    pub data: LogData,
    pub block_number: u64,
    pub tx_hash: String,
}

impl RawLog {
    /// Build from hex fields, with or without `0x` prefixes. The transaction
    /// hash is kept as the transport reports it.
    pub fn from_hex(
        address: &str,
        topics: &[String],
        data: &str,
        block_number: u64,
        tx_hash: &str,
    ) -> Result<Self, String> {
        let address = Address::from_str(address).map_err(|e| format!("invalid address {}: {}", address, e))?;
        let topics = topics
            .iter()
            .map(|t| B256::from_str(t).map_err(|e| format!("invalid topic {}: {}", t, e)))
            .collect::<Result<Vec<_>, _>>()?;
        let data = hex::decode(data.trim_start_matches("0x")).map_err(|e| format!("invalid hex: {}", e))?;
        let data = LogData::new(topics, Bytes::from(data)).ok_or_else(|| "more than four topics".to_string())?;
        Ok(Self {
            address,
            data,
            block_number,
            tx_hash: tx_hash.to_string(),
        })
    }
}

/// Decode a log into a typed event. Logs with an unknown topic yield `None`.
pub fn decode_log(log: &RawLog) -> Result<Option<ChainEvent>, String> {
    let Some(topic0) = log.data.topics().first() else {
        return Ok(None);
    };

    let topic0 = *topic0;
    let event = if topic0 == IERC20::Transfer::SIGNATURE_HASH {
        let e = IERC20::Transfer::decode_log_data(&log.data).map_err(|e| e.to_string())?;
        ChainEvent::Transfer(TransferEvent {
            block_number: log.block_number,
            tx_hash: log.tx_hash.clone(),
            token: address_hex(&log.address),
            from: address_hex(&e.from),
            to: address_hex(&e.to),
            value: e.value.try_into().map_err(|_| "transfer value exceeds 128 bits")?,
        })
    } else if topic0 == IGateway::OrderCreated::SIGNATURE_HASH {
        let e = IGateway::OrderCreated::decode_log_data(&log.data).map_err(|e| e.to_string())?;
        ChainEvent::OrderCreated(OrderCreatedEvent {
            block_number: log.block_number,
            tx_hash: log.tx_hash.clone(),
            sender: address_hex(&e.sender),
            token: address_hex(&e.token),
            amount: e.amount.try_into().map_err(|_| "order amount exceeds 128 bits")?,
            protocol_fee: e.protocolFee.try_into().map_err(|_| "protocol fee exceeds 128 bits")?,
            order_id: word_hex(&e.orderId),
            rate: e.rate.try_into().map_err(|_| "rate exceeds 128 bits")?,
            institution_code: short_string(&e.institutionCode),
            message_hash: e.messageHash,
        })
    } else if topic0 == IGateway::OrderSettled::SIGNATURE_HASH {
        let e = IGateway::OrderSettled::decode_log_data(&log.data).map_err(|e| e.to_string())?;
        ChainEvent::OrderSettled(OrderSettledEvent {
            block_number: log.block_number,
            tx_hash: log.tx_hash.clone(),
            split_order_id: word_hex(&e.splitOrderId),
            order_id: word_hex(&e.orderId),
            liquidity_provider: address_hex(&e.liquidityProvider),
            settle_percent: e.settlePercent.try_into().map_err(|_| "settle percent exceeds 128 bits")?,
        })
    } else if topic0 == IGateway::OrderRefunded::SIGNATURE_HASH {
        let e = IGateway::OrderRefunded::decode_log_data(&log.data).map_err(|e| e.to_string())?;
        ChainEvent::OrderRefunded(OrderRefundedEvent {
            block_number: log.block_number,
            tx_hash: log.tx_hash.clone(),
            fee: e.fee.try_into().map_err(|_| "refund fee exceeds 128 bits")?,
            order_id: word_hex(&e.orderId),
        })
    } else {
        return Ok(None);
    };

    Ok(Some(event))
}

/// Convert integer subunits into a decimal with the given scale
pub fn scale_units(raw: u128, decimals: u32) -> Result<Decimal, String> {
    let raw = i128::try_from(raw).map_err(|_| format!("value {} out of range", raw))?;
    Decimal::try_from_i128_with_scale(raw, decimals)
        .map(|d| d.normalize())
        .map_err(|e| format!("value {} with scale {}: {}", raw, decimals, e))
}

/// Lock order id carried in a `splitOrderId` word.
///
/// The gateway stores the UUID bytes left-aligned; the textual 36-char
/// form is accepted as well.
pub fn split_order_uuid(split_order_id: &str) -> Option<Uuid> {
    if let Ok(id) = Uuid::parse_str(split_order_id) {
        return Some(id);
    }
    let bytes = hex::decode(split_order_id.trim_start_matches("0x")).ok()?;
    if bytes.len() < 16 {
        return None;
    }
    if let Ok(text) = std::str::from_utf8(&bytes) {
        if let Ok(id) = Uuid::parse_str(text.trim_end_matches('\0')) {
            return Some(id);
        }
    }
    Uuid::from_slice(&bytes[..16]).ok()
}

pub fn normalize_hex(value: &str) -> String {
    let bare = value.trim_start_matches("0x").to_ascii_lowercase();
    format!("0x{}", bare)
}

pub fn address_hex(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_slice()))
}

fn word_hex(word: &B256) -> String {
    format!("0x{}", hex::encode(word.as_slice()))
}

fn short_string(word: &FixedBytes<32>) -> String {
    let bytes = word.as_slice();
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;
    use rust_decimal_macros::dec;

    fn raw(address: Address, data: LogData) -> RawLog {
        RawLog {
            address,
            data,
            block_number: 7,
            tx_hash: "0x01".into(),
        }
    }

    #[test]
    fn test_decode_transfer() {
        let token = Address::from_str("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48").unwrap();
        let transfer = IERC20::Transfer {
            from: Address::repeat_byte(0xab),
            to: Address::repeat_byte(0xcd),
            value: U256::from(1_500_000u64),
        };

        match decode_log(&raw(token, transfer.encode_log_data())).unwrap() {
            Some(ChainEvent::Transfer(transfer)) => {
                assert_eq!(transfer.to, format!("0x{}", "cd".repeat(20)));
                assert_eq!(transfer.value, 1_500_000);
                assert_eq!(scale_units(transfer.value, 6).unwrap(), dec!(1.5));
                assert_eq!(transfer.token, "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_order_created_with_message() {
        let created = IGateway::OrderCreated {
            sender: Address::repeat_byte(0x11),
            token: Address::repeat_byte(0x22),
            amount: U256::from(250_000_000u64),
            protocolFee: U256::ZERO,
            orderId: B256::repeat_byte(0xab),
            rate: U256::from(150_050u64),
            institutionCode: FixedBytes::right_padding_from(b"GTBINGLA"),
            messageHash: "c2VjcmV0".into(),
        };

        match decode_log(&raw(Address::ZERO, created.encode_log_data())).unwrap() {
            Some(ChainEvent::OrderCreated(event)) => {
                assert_eq!(event.order_id, format!("0x{}", "ab".repeat(32)));
                assert_eq!(event.amount, 250_000_000);
                assert_eq!(scale_units(event.rate, RATE_DECIMALS).unwrap(), dec!(1500.5));
                assert_eq!(event.institution_code, "GTBINGLA");
                assert_eq!(event.message_hash, "c2VjcmV0");
                assert_eq!(event.sender, format!("0x{}", "11".repeat(20)));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_settled_from_hex_fields() {
        let settled = IGateway::OrderSettled {
            splitOrderId: B256::repeat_byte(0x01),
            orderId: B256::repeat_byte(0x02),
            liquidityProvider: Address::repeat_byte(0x03),
            settlePercent: alloy::primitives::Uint::from(40_000u64),
        };
        let data = settled.encode_log_data();
        let topics: Vec<String> = data.topics().iter().map(|t| hex::encode(t.as_slice())).collect();

        let log = RawLog::from_hex(
            "847dfdaa218f9137229cf8424378871a1da8f625",
            &topics,
            &hex::encode(&data.data),
            12,
            "abcd",
        )
        .unwrap();
        assert_eq!(log.tx_hash, "abcd");

        match decode_log(&log).unwrap() {
            Some(ChainEvent::OrderSettled(event)) => {
                assert_eq!(event.order_id, format!("0x{}", "02".repeat(32)));
                assert_eq!(scale_units(event.settle_percent, SETTLE_PERCENT_DECIMALS).unwrap(), dec!(40));
                assert_eq!(event.block_number, 12);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_topic_is_ignored() {
        let data = LogData::new_unchecked(vec![B256::ZERO], Bytes::new());
        assert!(decode_log(&raw(Address::ZERO, data)).unwrap().is_none());
    }

    #[test]
    fn test_truncated_data_is_an_error() {
        let data = LogData::new_unchecked(
            vec![IGateway::OrderRefunded::SIGNATURE_HASH, B256::ZERO],
            Bytes::from(vec![0u8; 3]),
        );
        assert!(decode_log(&raw(Address::ZERO, data)).is_err());
    }

    #[test]
    fn test_split_order_uuid_forms() {
        let id = Uuid::new_v4();
        let left_aligned = format!("0x{}{}", hex::encode(id.as_bytes()), "00".repeat(16));
        assert_eq!(split_order_uuid(&left_aligned), Some(id));
        assert_eq!(split_order_uuid(&id.to_string()), Some(id));
        assert_eq!(split_order_uuid("0x1234"), None);
    }

    #[test]
    fn test_settle_percent_scale() {
        assert_eq!(scale_units(100_000, SETTLE_PERCENT_DECIMALS).unwrap(), dec!(100));
        assert_eq!(scale_units(40_000, SETTLE_PERCENT_DECIMALS).unwrap(), dec!(40));
    }
}
