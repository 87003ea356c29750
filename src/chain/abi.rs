//! Solidity ABI helpers for the fixed contract surface this canister calls.
//!
//! Selectors and event topics are recomputed from canonical signatures with
//! keccak-256 instead of being pasted in as magic constants, so a typo in a
//! signature fails loudly in tests. Encoding covers the head/tail layout for
//! the argument shapes the registry, oracle, and token calls actually use:
//! static words plus dynamic `address[]`/`uint256[]` arrays.

use alloy_primitives::{keccak256, U256};

const WORD_BYTES: usize = 32;

/// Argument for [`encode_call`]. Arrays are dynamic and follow the standard
/// offset/length tail layout.
#[derive(Clone, Debug)]
pub enum AbiToken {
    Address(String),
    Uint(U256),
    Bool(bool),
    AddressArray(Vec<String>),
    UintArray(Vec<U256>),
}

pub fn function_selector(signature: &str) -> String {
    let hash = keccak256(signature.as_bytes());
    format!("0x{}", hex::encode(&hash.as_slice()[..4]))
}

pub fn event_topic0(signature: &str) -> String {
    let hash = keccak256(signature.as_bytes());
    format!("0x{}", hex::encode(hash.as_slice()))
}

/// Calldata = 4-byte selector || ABI-encoded arguments (no length prefix).
pub fn encode_call(signature: &str, args: &[AbiToken]) -> Result<String, String> {
    let selector = function_selector(signature);
    let encoded = encode_tokens(args)?;
    Ok(format!(
        "{}{}",
        selector,
        hex::encode(encoded)
    ))
}

fn encode_tokens(args: &[AbiToken]) -> Result<Vec<u8>, String> {
    // Static tokens occupy one head word; dynamic tokens reserve one offset
    // word in the head and append length + items to the tail.
    let head_size_bytes = args.len().saturating_mul(WORD_BYTES);
    let mut heads: Vec<[u8; WORD_BYTES]> = Vec::with_capacity(args.len());
    let mut tails: Vec<Vec<u8>> = Vec::new();
    let mut tail_size_bytes = 0usize;

    for (index, arg) in args.iter().enumerate() {
        match arg {
            AbiToken::Address(address) => {
                heads.push(encode_address_word(address).map_err(|error| {
                    format!("arg[{index}]: {error}")
                })?);
            }
            AbiToken::Uint(value) => heads.push(encode_u256_word(*value)),
            AbiToken::Bool(flag) => heads.push(encode_u256_word(U256::from(u8::from(*flag)))),
            AbiToken::AddressArray(addresses) => {
                let mut tail = Vec::with_capacity((addresses.len() + 1) * WORD_BYTES);
                tail.extend_from_slice(&encode_u256_word(U256::from(addresses.len())));
                for (item_index, address) in addresses.iter().enumerate() {
                    tail.extend_from_slice(&encode_address_word(address).map_err(|error| {
                        format!("arg[{index}][{item_index}]: {error}")
                    })?);
                }
                let offset = head_size_bytes.saturating_add(tail_size_bytes);
                heads.push(encode_u256_word(U256::from(offset)));
                tail_size_bytes = tail_size_bytes.saturating_add(tail.len());
                tails.push(tail);
            }
            AbiToken::UintArray(values) => {
                let mut tail = Vec::with_capacity((values.len() + 1) * WORD_BYTES);
                tail.extend_from_slice(&encode_u256_word(U256::from(values.len())));
                for value in values {
                    tail.extend_from_slice(&encode_u256_word(*value));
                }
                let offset = head_size_bytes.saturating_add(tail_size_bytes);
                heads.push(encode_u256_word(U256::from(offset)));
                tail_size_bytes = tail_size_bytes.saturating_add(tail.len());
                tails.push(tail);
            }
        }
    }

    let mut out = Vec::with_capacity(head_size_bytes.saturating_add(tail_size_bytes));
    for head in heads {
        out.extend_from_slice(&head);
    }
    for tail in tails {
        out.extend_from_slice(&tail);
    }
    Ok(out)
}

pub fn encode_address_word(address: &str) -> Result<[u8; WORD_BYTES], String> {
    let trimmed = address.trim().to_ascii_lowercase();
    let without_prefix = trimmed
        .strip_prefix("0x")
        .ok_or_else(|| "address must be 0x-prefixed".to_string())?;
    if without_prefix.len() != 40 {
        return Err("address must be exactly 20 bytes of hex".to_string());
    }
    let mut word = [0u8; WORD_BYTES];
    hex::decode_to_slice(without_prefix, &mut word[12..])
        .map_err(|error| format!("address is not valid hex: {error}"))?;
    Ok(word)
}

pub fn encode_u256_word(value: U256) -> [u8; WORD_BYTES] {
    value.to_be_bytes::<WORD_BYTES>()
}

// ── Result / event-data decoding ─────────────────────────────────────────────

/// Strip the `0x` prefix and decode the hex payload of an `eth_call` result
/// or a log's `data` field.
pub fn decode_hex_payload(raw: &str, field: &str) -> Result<Vec<u8>, String> {
    let trimmed = raw.trim();
    let without_prefix = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| format!("{field} must be 0x-prefixed hex"))?;
    hex::decode(without_prefix).map_err(|error| format!("{field} is not valid hex: {error}"))
}

pub fn word_at<'a>(data: &'a [u8], index: usize, field: &str) -> Result<&'a [u8], String> {
    let start = index.saturating_mul(WORD_BYTES);
    let end = start.saturating_add(WORD_BYTES);
    if end > data.len() {
        return Err(format!(
            "{field} is too short: wanted word {index}, payload is {} bytes",
            data.len()
        ));
    }
    Ok(&data[start..end])
}

pub fn decode_u256_word(data: &[u8], index: usize, field: &str) -> Result<U256, String> {
    Ok(U256::from_be_slice(word_at(data, index, field)?))
}

pub fn decode_u64_word(data: &[u8], index: usize, field: &str) -> Result<u64, String> {
    let value = decode_u256_word(data, index, field)?;
    u64::try_from(value).map_err(|_| format!("{field} word {index} exceeds u64 range"))
}

pub fn decode_address_word(data: &[u8], index: usize, field: &str) -> Result<String, String> {
    let word = word_at(data, index, field)?;
    if word[..12].iter().any(|byte| *byte != 0) {
        return Err(format!("{field} word {index} is not a left-padded address"));
    }
    Ok(format!("0x{}", hex::encode(&word[12..])))
}

pub fn decode_bool_word(data: &[u8], index: usize, field: &str) -> Result<bool, String> {
    let value = decode_u256_word(data, index, field)?;
    if value > U256::from(1u64) {
        return Err(format!("{field} word {index} is not a boolean"));
    }
    Ok(value == U256::from(1u64))
}

/// Decode an `int256` word as a sign-prefixed decimal string. Negative values
/// are stored as two's complement, so the magnitude is `2^256 - raw`.
pub fn decode_int256_word(data: &[u8], index: usize, field: &str) -> Result<String, String> {
    let raw = decode_u256_word(data, index, field)?;
    if raw.bit(255) {
        let magnitude = (!raw).wrapping_add(U256::from(1u64));
        Ok(format!("-{magnitude}"))
    } else {
        Ok(raw.to_string())
    }
}

/// Decode a dynamic `string` whose offset word sits at head position `index`.
pub fn decode_string_word(data: &[u8], index: usize, field: &str) -> Result<String, String> {
    let offset = decode_u256_word(data, index, field)?;
    let offset = usize::try_from(offset)
        .map_err(|_| format!("{field} string offset exceeds payload size"))?;
    if offset.saturating_add(WORD_BYTES) > data.len() {
        return Err(format!("{field} string offset points past the payload"));
    }
    let length = U256::from_be_slice(&data[offset..offset + WORD_BYTES]);
    let length =
        usize::try_from(length).map_err(|_| format!("{field} string length is implausible"))?;
    let start = offset.saturating_add(WORD_BYTES);
    let end = start.saturating_add(length);
    if end > data.len() {
        return Err(format!("{field} string body extends past the payload"));
    }
    String::from_utf8(data[start..end].to_vec())
        .map_err(|error| format!("{field} string was not valid utf-8: {error}"))
}

/// Decode a bare `bool` return from `eth_call` (single word, 0 or 1).
pub fn decode_bool_result(raw: &str, field: &str) -> Result<bool, String> {
    let data = decode_hex_payload(raw, field)?;
    if data.is_empty() {
        return Err(format!("{field} returned no data"));
    }
    decode_bool_word(&data, 0, field)
}

/// Decode a bare `uint256` return from `eth_call`.
pub fn decode_u256_result(raw: &str, field: &str) -> Result<U256, String> {
    let data = decode_hex_payload(raw, field)?;
    if data.is_empty() {
        return Err(format!("{field} returned no data"));
    }
    decode_u256_word(&data, 0, field)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_selector_matches_known_erc20_transfer() {
        assert_eq!(
            function_selector("transfer(address,uint256)"),
            "0xa9059cbb"
        );
    }

    #[test]
    fn function_selector_matches_known_balance_of() {
        assert_eq!(function_selector("balanceOf(address)"), "0x70a08231");
    }

    #[test]
    fn encode_call_lays_out_static_words_in_order() {
        let calldata = encode_call(
            "transfer(address,uint256)",
            &[
                AbiToken::Address("0x2222222222222222222222222222222222222222".to_string()),
                AbiToken::Uint(U256::from(1000u64)),
            ],
        )
        .expect("static encoding should succeed");

        assert_eq!(
            calldata,
            format!(
                "0xa9059cbb{}{}",
                "0000000000000000000000002222222222222222222222222222222222222222",
                "00000000000000000000000000000000000000000000000000000000000003e8"
            )
        );
    }

    #[test]
    fn encode_call_places_dynamic_arrays_in_the_tail() {
        let calldata = encode_call(
            "updateReputationBatch(address[],uint256[])",
            &[
                AbiToken::AddressArray(vec![
                    "0x1111111111111111111111111111111111111111".to_string(),
                ]),
                AbiToken::UintArray(vec![U256::from(76u64)]),
            ],
        )
        .expect("dynamic encoding should succeed");

        let body = calldata
            .strip_prefix(&function_selector("updateReputationBatch(address[],uint256[])"))
            .expect("calldata should start with the selector")
            .to_string();
        let words: Vec<&str> = body
            .as_bytes()
            .chunks(64)
            .map(|chunk| std::str::from_utf8(chunk).expect("hex chunks are ascii"))
            .collect();

        // head: offset to first array (0x40), offset to second array (0x80)
        assert_eq!(words[0], &format!("{:064x}", 0x40));
        assert_eq!(words[1], &format!("{:064x}", 0x80));
        // first tail: length 1 then the address word
        assert_eq!(words[2], &format!("{:064x}", 1));
        assert_eq!(
            words[3],
            "0000000000000000000000001111111111111111111111111111111111111111"
        );
        // second tail: length 1 then the score word
        assert_eq!(words[4], &format!("{:064x}", 1));
        assert_eq!(words[5], &format!("{:064x}", 76));
    }

    #[test]
    fn decode_int256_word_handles_negative_two_complement() {
        let minus_five = (!U256::from(5u64)).wrapping_add(U256::from(1u64));
        let mut data = Vec::new();
        data.extend_from_slice(&encode_u256_word(minus_five));
        data.extend_from_slice(&encode_u256_word(U256::from(7u64)));

        assert_eq!(
            decode_int256_word(&data, 0, "profitLoss").expect("negative decode"),
            "-5"
        );
        assert_eq!(
            decode_int256_word(&data, 1, "profitLoss").expect("positive decode"),
            "7"
        );
    }

    #[test]
    fn decode_string_word_follows_the_offset_into_the_tail() {
        // Layout of (string, uint8): offset, riskLevel, then length + bytes.
        let mut data = Vec::new();
        data.extend_from_slice(&encode_u256_word(U256::from(0x40u64)));
        data.extend_from_slice(&encode_u256_word(U256::from(7u64)));
        data.extend_from_slice(&encode_u256_word(U256::from(8u64)));
        let mut body = b"momentum".to_vec();
        body.resize(32, 0);
        data.extend_from_slice(&body);

        assert_eq!(
            decode_string_word(&data, 0, "strategy").expect("string decode"),
            "momentum"
        );
        assert_eq!(
            decode_u64_word(&data, 1, "riskLevel").expect("risk decode"),
            7
        );
    }

    #[test]
    fn decode_address_word_rejects_dirty_padding() {
        let mut data = vec![0u8; 32];
        data[0] = 1;
        assert!(decode_address_word(&data, 0, "agent").is_err());
    }

    #[test]
    fn decode_bool_result_reads_single_word_returns() {
        let yes = format!("0x{:064x}", 1);
        let no = format!("0x{:064x}", 0);
        assert!(decode_bool_result(&yes, "isAuthorizedUpdater").expect("bool decode"));
        assert!(!decode_bool_result(&no, "isAuthorizedUpdater").expect("bool decode"));
        assert!(decode_bool_result("0x", "isAuthorizedUpdater").is_err());
    }
}
