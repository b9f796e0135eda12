//! Reward output script derivation.
//!
//! The coinbase pays the block reward to a script built once, after the
//! node has confirmed the pool address. Proof-of-work coins pay to the
//! address script; proof-of-stake coins pay to the raw public key the node
//! reports for the address.

use crate::{Error, Result};
use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, PublicKey, ScriptBuf};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How the reward output script is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewardType {
    /// Pay to the address script
    Pow,
    /// Pay to the address public key
    Pos,
}

impl FromStr for RewardType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pow" => Ok(RewardType::Pow),
            "pos" => Ok(RewardType::Pos),
            _ => Err(Error::Config(format!("Invalid reward type: {}", s))),
        }
    }
}

/// Result of `validateaddress` as far as reward derivation cares
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AddressInfo {
    #[serde(default)]
    pub isvalid: bool,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default, rename = "scriptPubKey")]
    pub script_pub_key: Option<String>,
    #[serde(default)]
    pub pubkey: Option<String>,
}

/// Output script that receives the block reward
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyBuffer(ScriptBuf);

impl PublicKeyBuffer {
    /// Derive the reward script from a validated address
    pub fn derive(reward: RewardType, configured_address: &str, info: &AddressInfo) -> Result<Self> {
        match reward {
            RewardType::Pow => {
                if let Some(script_hex) = &info.script_pub_key {
                    let script = ScriptBuf::from_bytes(hex::decode(script_hex)?);
                    return Ok(Self(script));
                }

                let address_str = info.address.as_deref().unwrap_or(configured_address);
                let address: Address<NetworkUnchecked> = address_str.parse()
                    .map_err(|e| Error::Address(format!("Invalid pool address {}: {}", address_str, e)))?;
                Ok(Self(address.assume_checked().script_pubkey()))
            }
            RewardType::Pos => {
                let pubkey_hex = info.pubkey.as_deref().ok_or_else(|| {
                    Error::Address(format!("Node did not report a public key for {}", configured_address))
                })?;
                let pubkey = PublicKey::from_str(pubkey_hex)
                    .map_err(|e| Error::Address(format!("Invalid public key {}: {}", pubkey_hex, e)))?;
                Ok(Self(ScriptBuf::new_p2pk(&pubkey)))
            }
        }
    }

    /// Wrap an already-built script
    pub fn from_script(script: ScriptBuf) -> Self {
        Self(script)
    }

    pub fn script(&self) -> &ScriptBuf {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}
