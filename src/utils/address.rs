//! Bech32 address derivation.
//!
//! Validators carry one key pair but several addresses: the operator
//! (`...valoper1...`) used by the staking module, the consensus address
//! (`...valcons1...`) that appears in block signatures, and the plain account
//! address used as a governance voter. All are re-encodings of byte strings
//! under different human-readable parts.

use bech32::{Bech32, Hrp};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::models::cosmos::{ED25519_TYPE_URL, SECP256K1_TYPE_URL};
use crate::models::error::MonitorError;

/// Computes the 20-byte consensus address hash for a consensus public key.
pub fn pubkey_to_address(type_url: &str, key: &[u8]) -> Result<Vec<u8>, MonitorError> {
	match type_url {
		ED25519_TYPE_URL => Ok(Sha256::digest(key)[..20].to_vec()),
		SECP256K1_TYPE_URL => {
			let sha = Sha256::digest(key);
			Ok(Ripemd160::digest(sha).to_vec())
		}
		other => Err(MonitorError::Parse(format!(
			"unsupported consensus pubkey type {other:?}"
		))),
	}
}

/// Decodes a bech32 address into its raw bytes.
pub fn decode_bytes(addr: &str) -> Result<Vec<u8>, MonitorError> {
	let (_, data) = bech32::decode(addr)
		.map_err(|e| MonitorError::Parse(format!("cannot decode bech32 address {addr:?}: {e}")))?;
	Ok(data)
}

/// Encodes `bytes` under the consensus HRP derived from a valoper address
/// (the `valoper` segment is replaced with `valcons`).
pub fn valcons_from_valoper(valoper: &str, address_hash: &[u8]) -> Result<String, MonitorError> {
	let (hrp, _) = bech32::decode(valoper)
		.map_err(|e| MonitorError::Parse(format!("cannot decode {valoper:?}: {e}")))?;
	let hrp = hrp.to_string();
	if !hrp.contains("valoper") {
		return Err(MonitorError::Parse(format!(
			"cannot derive a consensus prefix from {valoper:?}"
		)));
	}
	let cons_hrp = hrp.replacen("valoper", "valcons", 1);
	encode(&cons_hrp, &address_hash[..20.min(address_hash.len())])
}

/// Re-encodes a valoper address under the chain's base account prefix, the
/// form governance votes are recorded against. Non-valoper input is returned
/// unchanged.
pub fn account_from_valoper(valoper: &str) -> Result<String, MonitorError> {
	if !valoper.contains("valoper") {
		return Ok(valoper.to_string());
	}
	let (hrp, data) = bech32::decode(valoper)
		.map_err(|e| MonitorError::Parse(format!("cannot decode {valoper:?}: {e}")))?;
	let base = hrp.to_string().replacen("valoper", "", 1);
	encode(&base, &data)
}

fn encode(hrp: &str, data: &[u8]) -> Result<String, MonitorError> {
	let hrp = Hrp::parse(hrp)
		.map_err(|e| MonitorError::Parse(format!("invalid bech32 prefix {hrp:?}: {e}")))?;
	bech32::encode::<Bech32>(hrp, data)
		.map_err(|e| MonitorError::Parse(format!("bech32 encoding failed: {e}")))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn fake_valoper(bytes: &[u8]) -> String {
		bech32::encode::<Bech32>(Hrp::parse("cosmosvaloper").unwrap(), bytes).unwrap()
	}

	#[test]
	fn account_conversion_swaps_prefix_keeps_bytes() {
		let bytes: Vec<u8> = (0..20).collect();
		let valoper = fake_valoper(&bytes);
		let account = account_from_valoper(&valoper).unwrap();
		assert!(account.starts_with("cosmos1"));
		assert_eq!(decode_bytes(&account).unwrap(), bytes);
	}

	#[test]
	fn account_conversion_passes_through_non_valoper() {
		assert_eq!(account_from_valoper("cosmos1abcdef").unwrap(), "cosmos1abcdef");
	}

	#[test]
	fn valcons_uses_consensus_prefix_and_20_bytes() {
		let valoper = fake_valoper(&(0..20).collect::<Vec<u8>>());
		let hash: Vec<u8> = (100..120).collect();
		let valcons = valcons_from_valoper(&valoper, &hash).unwrap();
		assert!(valcons.starts_with("cosmosvalcons1"));
		assert_eq!(decode_bytes(&valcons).unwrap(), hash);
	}

	#[test]
	fn ed25519_address_is_sha256_prefix() {
		let key = [7u8; 32];
		let addr = pubkey_to_address(ED25519_TYPE_URL, &key).unwrap();
		assert_eq!(addr.len(), 20);
		assert_eq!(addr, Sha256::digest(key)[..20].to_vec());
	}

	#[test]
	fn secp256k1_address_is_hash160() {
		let key = [9u8; 33];
		let addr = pubkey_to_address(SECP256K1_TYPE_URL, &key).unwrap();
		assert_eq!(addr.len(), 20);
	}

	#[test]
	fn unknown_key_type_is_rejected() {
		assert!(pubkey_to_address("/cosmos.crypto.sr25519.PubKey", &[0u8; 32]).is_err());
	}
}
