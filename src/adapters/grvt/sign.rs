// =============================================================================
// GRVT Order Signing — EIP-712 typed data over secp256k1
// =============================================================================
//
// Orders are signed against the domain {name: "GRVT Exchange", version: "0",
// chainId} with the message type
//
//   Order(uint64 subAccountID, bool isMarket, uint8 timeInForce,
//         bool postOnly, bool reduceOnly, OrderLeg[] legs,
//         uint32 nonce, int64 expiration)
//   OrderLeg(uint256 assetID, uint64 contractSize, uint64 limitPrice,
//            bool isBuyingContract)
//
// Scaling rules: assetID is the cached instrument hash; contractSize is the
// decimal size scaled by 10^base_decimals (round down); limitPrice is
// scaled by 1e9 (round down; market orders carry 0).
// =============================================================================

use ethers_core::types::transaction::eip712::EIP712Domain;
use ethers_core::types::{H256, U256};
use ethers_core::utils::keccak256;
use ethers_signers::{LocalWallet, Signer};
use rand::Rng;
use serde::Serialize;
use std::str::FromStr;

use crate::error::{ExchangeError, ExchangeResult};
use crate::types::OrderType;

/// Limit prices are encoded as integers with 9 decimal places.
pub const PRICE_MULTIPLIER: f64 = 1e9;

const ORDER_TYPE: &str = "Order(uint64 subAccountID,bool isMarket,uint8 timeInForce,\
bool postOnly,bool reduceOnly,OrderLeg[] legs,uint32 nonce,int64 expiration)\
OrderLeg(uint256 assetID,uint64 contractSize,uint64 limitPrice,bool isBuyingContract)";

const LEG_TYPE: &str =
    "OrderLeg(uint256 assetID,uint64 contractSize,uint64 limitPrice,bool isBuyingContract)";

/// Time-in-force wire names mapped to their signature codes.
pub fn time_in_force_code(tif: &str) -> ExchangeResult<u8> {
    match tif {
        "GOOD_TILL_TIME" => Ok(1),
        "ALL_OR_NONE" => Ok(2),
        "IMMEDIATE_OR_CANCEL" => Ok(3),
        "FILL_OR_KILL" => Ok(4),
        other => Err(ExchangeError::Consistency(format!(
            "grvt: unknown time in force {other}"
        ))),
    }
}

/// Wire time-in-force for one of our order types.
pub fn time_in_force_for(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Ioc => "IMMEDIATE_OR_CANCEL",
        OrderType::Fok => "FILL_OR_KILL",
        _ => "GOOD_TILL_TIME",
    }
}

/// One leg, already scaled for signing.
#[derive(Debug, Clone)]
pub struct SignedLeg {
    pub asset_id: U256,
    pub contract_size: u64,
    pub limit_price: u64,
    pub is_buying: bool,
}

impl SignedLeg {
    /// Scale a decimal leg into signature units.
    pub fn scale(
        instrument_hash: &str,
        size: f64,
        limit_price: Option<f64>,
        base_decimals: u32,
        is_buying: bool,
    ) -> ExchangeResult<Self> {
        let asset_id = parse_instrument_hash(instrument_hash)?;
        let size_multiplier = 10f64.powi(base_decimals as i32);
        Ok(Self {
            asset_id,
            contract_size: (size * size_multiplier).floor() as u64,
            limit_price: (limit_price.unwrap_or(0.0) * PRICE_MULTIPLIER).floor() as u64,
            is_buying,
        })
    }
}

/// Signature fields submitted alongside the order payload.
#[derive(Debug, Clone, Serialize)]
pub struct OrderSignature {
    pub r: String,
    pub s: String,
    pub v: u8,
    pub signer: String,
    pub nonce: u32,
    pub expiration: String,
    pub chain_id: String,
}

/// Inputs to the typed-data hash.
#[derive(Debug, Clone)]
pub struct OrderToSign {
    pub sub_account_id: u64,
    pub is_market: bool,
    pub time_in_force: u8,
    pub post_only: bool,
    pub reduce_only: bool,
    pub legs: Vec<SignedLeg>,
    pub nonce: u32,
    /// Unix nanoseconds.
    pub expiration: i64,
}

/// Fresh random nonce for a signature payload.
pub fn generate_nonce() -> u32 {
    rand::thread_rng().gen()
}

fn parse_instrument_hash(hash: &str) -> ExchangeResult<U256> {
    let trimmed = hash.trim().trim_start_matches("0x");
    U256::from_str_radix(trimmed, 16)
        .map_err(|_| ExchangeError::Consistency(format!("grvt: invalid instrument hash {hash}")))
}

fn encode_u256(value: U256) -> [u8; 32] {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    buf
}

fn encode_u64(value: u64) -> [u8; 32] {
    encode_u256(U256::from(value))
}

fn encode_bool(value: bool) -> [u8; 32] {
    encode_u256(U256::from(value as u8))
}

fn leg_struct_hash(leg: &SignedLeg) -> [u8; 32] {
    let mut encoded = Vec::with_capacity(5 * 32);
    encoded.extend_from_slice(&keccak256(LEG_TYPE.as_bytes()));
    encoded.extend_from_slice(&encode_u256(leg.asset_id));
    encoded.extend_from_slice(&encode_u64(leg.contract_size));
    encoded.extend_from_slice(&encode_u64(leg.limit_price));
    encoded.extend_from_slice(&encode_bool(leg.is_buying));
    keccak256(&encoded)
}

fn order_struct_hash(order: &OrderToSign) -> [u8; 32] {
    // Array member: keccak of the concatenated element struct hashes.
    let mut legs_concat = Vec::with_capacity(order.legs.len() * 32);
    for leg in &order.legs {
        legs_concat.extend_from_slice(&leg_struct_hash(leg));
    }
    let legs_hash = keccak256(&legs_concat);

    let mut encoded = Vec::with_capacity(9 * 32);
    encoded.extend_from_slice(&keccak256(ORDER_TYPE.as_bytes()));
    encoded.extend_from_slice(&encode_u64(order.sub_account_id));
    encoded.extend_from_slice(&encode_bool(order.is_market));
    encoded.extend_from_slice(&encode_u64(order.time_in_force as u64));
    encoded.extend_from_slice(&encode_bool(order.post_only));
    encoded.extend_from_slice(&encode_bool(order.reduce_only));
    encoded.extend_from_slice(&legs_hash);
    encoded.extend_from_slice(&encode_u64(order.nonce as u64));
    // expiration is int64; order expiries are always positive so the
    // two's-complement encoding matches the unsigned one.
    encoded.extend_from_slice(&encode_u64(order.expiration as u64));
    keccak256(&encoded)
}

fn signing_digest(order: &OrderToSign, chain_id: u64) -> H256 {
    let domain = EIP712Domain {
        name: Some("GRVT Exchange".to_string()),
        version: Some("0".to_string()),
        chain_id: Some(U256::from(chain_id)),
        verifying_contract: None,
        salt: None,
    };
    let domain_separator = domain.separator();
    let struct_hash = order_struct_hash(order);

    let mut payload = Vec::with_capacity(2 + 32 + 32);
    payload.extend_from_slice(&[0x19, 0x01]);
    payload.extend_from_slice(&domain_separator);
    payload.extend_from_slice(&struct_hash);
    H256::from(keccak256(&payload))
}

/// Sign an order, producing the signature block for the create-order
/// payload. Deterministic given `(order, chain_id, private_key)`.
pub fn sign_order(
    private_key: &str,
    chain_id: u64,
    order: &OrderToSign,
) -> ExchangeResult<OrderSignature> {
    let wallet = LocalWallet::from_str(private_key)
        .map_err(|e| ExchangeError::Auth(format!("grvt: invalid private key: {e}")))?;

    let digest = signing_digest(order, chain_id);
    let sig = wallet
        .sign_hash(digest)
        .map_err(|e| ExchangeError::Auth(format!("grvt: signing failed: {e}")))?;

    Ok(OrderSignature {
        r: format!("0x{:064x}", sig.r),
        s: format!("0x{:064x}", sig.s),
        v: sig.v as u8,
        signer: format!("{:?}", wallet.address()),
        nonce: order.nonce,
        expiration: order.expiration.to_string(),
        chain_id: chain_id.to_string(),
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "0x0123456789012345678901234567890123456789012345678901234567890123";

    fn sample_order() -> OrderToSign {
        OrderToSign {
            sub_account_id: 8566,
            is_market: true,
            time_in_force: 3,
            post_only: false,
            reduce_only: false,
            legs: vec![SignedLeg {
                asset_id: U256::from(0x030501u64),
                contract_size: 1_000_000_000,
                limit_price: 0,
                is_buying: true,
            }],
            nonce: 42,
            expiration: 1_700_000_000_000_000_000,
        }
    }

    #[test]
    fn tif_codes_match_wire_contract() {
        assert_eq!(time_in_force_code("GOOD_TILL_TIME").unwrap(), 1);
        assert_eq!(time_in_force_code("ALL_OR_NONE").unwrap(), 2);
        assert_eq!(time_in_force_code("IMMEDIATE_OR_CANCEL").unwrap(), 3);
        assert_eq!(time_in_force_code("FILL_OR_KILL").unwrap(), 4);
        assert!(time_in_force_code("GTC").is_err());
    }

    #[test]
    fn leg_scaling_rounds_down() {
        let leg = SignedLeg::scale("0x0305", 0.0123456789, Some(1.9999999999), 9, true).unwrap();
        assert_eq!(leg.contract_size, 12_345_678); // 0.0123456789 * 1e9, floored
        assert_eq!(leg.limit_price, 1_999_999_999);
        assert_eq!(leg.asset_id, U256::from(0x0305u64));
    }

    #[test]
    fn market_leg_has_zero_limit_price() {
        let leg = SignedLeg::scale("0xff", 1.0, None, 6, false).unwrap();
        assert_eq!(leg.limit_price, 0);
        assert_eq!(leg.contract_size, 1_000_000);
        assert!(!leg.is_buying);
    }

    #[test]
    fn invalid_instrument_hash_rejected() {
        assert!(SignedLeg::scale("not-hex", 1.0, None, 6, true).is_err());
    }

    #[test]
    fn signing_is_deterministic() {
        let order = sample_order();
        let a = sign_order(TEST_KEY, 325, &order).unwrap();
        let b = sign_order(TEST_KEY, 325, &order).unwrap();
        assert_eq!(a.r, b.r);
        assert_eq!(a.s, b.s);
        assert_eq!(a.v, b.v);
        assert!(a.r.starts_with("0x"));
        assert_eq!(a.r.len(), 66);
        assert_eq!(a.chain_id, "325");
    }

    #[test]
    fn digest_depends_on_chain_id_and_nonce() {
        let order = sample_order();
        let prod = signing_digest(&order, 325);
        let testnet = signing_digest(&order, 326);
        assert_ne!(prod, testnet);

        let mut renonced = sample_order();
        renonced.nonce = 43;
        assert_ne!(signing_digest(&order, 325), signing_digest(&renonced, 325));
    }

    #[test]
    fn digest_depends_on_leg_contents() {
        let order = sample_order();
        let mut resized = sample_order();
        resized.legs[0].contract_size += 1;
        assert_ne!(signing_digest(&order, 325), signing_digest(&resized, 325));
    }
}
