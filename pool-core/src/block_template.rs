use crate::{Result, Error};
use crate::reward::PublicKeyBuffer;
use crate::types::JobParams;
use bitcoin::blockdata::script::Builder;
use bitcoin::consensus::encode::{serialize, VarInt};
use bitcoin::{CompactTarget, ScriptBuf, Target, TxOut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Difficulty 1 target, 0xffff * 2^208
pub const DIFF1: f64 = 26959535291011309493156476344723991336010898738574164086137773096960.0;

/// Block template as returned by `getblocktemplate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockTemplate {
    pub version: u32,
    pub previousblockhash: String,
    #[serde(default)]
    pub transactions: Vec<TemplateTransaction>,
    #[serde(default)]
    pub coinbaseaux: HashMap<String, String>,
    pub coinbasevalue: u64,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub mintime: u32,
    pub curtime: u32,
    pub bits: String,
    pub height: u64,
    #[serde(default)]
    pub default_witness_commitment: Option<String>,
}

/// Transaction in block template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateTransaction {
    pub data: String,
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
}

impl TemplateTransaction {
    /// Transaction id in internal byte order
    fn txid_bytes(&self) -> Result<[u8; 32]> {
        // Older nodes only report `hash`, which is the txid there
        match self.txid.as_ref().or(self.hash.as_ref()) {
            Some(id) => {
                let mut bytes = decode_hash(id)?;
                bytes.reverse();
                Ok(bytes)
            }
            None => Ok(sha256d(&hex::decode(&self.data)?)),
        }
    }
}

/// Double SHA256
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

fn decode_hash(hex_str: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str)?;
    bytes.try_into()
        .map_err(|_| Error::Template(format!("Hash must be 32 bytes: {}", hex_str)))
}

/// Interpret 32 little-endian bytes as a float
pub fn le_bytes_to_f64(bytes: &[u8; 32]) -> f64 {
    bytes.iter().rev().fold(0.0, |acc, &b| acc * 256.0 + b as f64)
}

/// Merkle branch for a coinbase at index 0 of the given transaction ids
fn merkle_branch(txids: &[[u8; 32]]) -> Vec<[u8; 32]> {
    let mut steps = Vec::new();
    let mut level = txids.to_vec();

    while !level.is_empty() {
        steps.push(level[0]);

        let rest = &level[1..];
        let mut next = Vec::with_capacity((rest.len() + 1) / 2);
        for pair in rest.chunks(2) {
            let right = pair.get(1).unwrap_or(&pair[0]);
            let mut joined = [0u8; 64];
            joined[..32].copy_from_slice(&pair[0]);
            joined[32..].copy_from_slice(right);
            next.push(sha256d(&joined));
        }
        level = next;
    }

    steps
}

/// Work unit derived from one block template
#[derive(Debug, Clone)]
pub struct MiningJob {
    job_id: String,
    template: BlockTemplate,
    coinb1: Vec<u8>,
    coinb2: Vec<u8>,
    merkle_branch: Vec<[u8; 32]>,
    previous_hash: [u8; 32],
    bits: u32,
    target: Target,
    block_diff: f64,
}

impl MiningJob {
    /// Create a new job, splitting the coinbase around `extranonce_size` bytes
    pub fn new(
        job_id: String,
        template: BlockTemplate,
        reward: &PublicKeyBuffer,
        extranonce_size: usize,
        coinbase_signature: &str,
    ) -> Result<Self> {
        // Parse previous block hash
        let mut previous_hash = decode_hash(&template.previousblockhash)?;
        previous_hash.reverse();

        let bits = u32::from_str_radix(&template.bits, 16)
            .map_err(|e| Error::Template(format!("Invalid bits {}: {}", template.bits, e)))?;
        let target = Target::from_compact(CompactTarget::from_consensus(bits));
        let target_value = le_bytes_to_f64(&target.to_le_bytes());
        if target_value == 0.0 {
            return Err(Error::Template("Invalid zero target".to_string()));
        }

        let txids = template
            .transactions
            .iter()
            .map(TemplateTransaction::txid_bytes)
            .collect::<Result<Vec<_>>>()?;

        let (coinb1, coinb2) = Self::build_coinbase(&template, reward, extranonce_size, coinbase_signature)?;

        Ok(Self {
            job_id,
            merkle_branch: merkle_branch(&txids),
            coinb1,
            coinb2,
            previous_hash,
            bits,
            target,
            block_diff: DIFF1 / target_value,
            template,
        })
    }

    /// Serialize the coinbase in two halves around the extranonce
    fn build_coinbase(
        template: &BlockTemplate,
        reward: &PublicKeyBuffer,
        extranonce_size: usize,
        coinbase_signature: &str,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        // Block height (BIP 34)
        let mut script_sig_part1 = Builder::new()
            .push_int(template.height as i64)
            .into_script()
            .into_bytes();
        for flags in template.coinbaseaux.values() {
            script_sig_part1.extend_from_slice(&hex::decode(flags)?);
        }
        script_sig_part1.push(extranonce_size as u8);

        let signature = coinbase_signature.as_bytes();
        let mut script_sig_part2 = Vec::with_capacity(signature.len() + 1);
        script_sig_part2.push(signature.len() as u8);
        script_sig_part2.extend_from_slice(signature);

        let script_sig_len = script_sig_part1.len() + extranonce_size + script_sig_part2.len();
        if script_sig_len > 100 {
            return Err(Error::Template(format!("Coinbase script too long: {} bytes", script_sig_len)));
        }

        let mut outputs = vec![TxOut {
            value: template.coinbasevalue,
            script_pubkey: reward.script().clone(),
        }];
        if let Some(commitment) = &template.default_witness_commitment {
            outputs.push(TxOut {
                value: 0,
                script_pubkey: ScriptBuf::from_bytes(hex::decode(commitment)?),
            });
        }

        let mut coinb1 = Vec::new();
        coinb1.extend_from_slice(&1u32.to_le_bytes());
        coinb1.extend_from_slice(&serialize(&VarInt(1)));
        coinb1.extend_from_slice(&[0u8; 32]);
        coinb1.extend_from_slice(&u32::MAX.to_le_bytes());
        coinb1.extend_from_slice(&serialize(&VarInt(script_sig_len as u64)));
        coinb1.extend_from_slice(&script_sig_part1);

        let mut coinb2 = script_sig_part2;
        coinb2.extend_from_slice(&u32::MAX.to_le_bytes());
        coinb2.extend_from_slice(&serialize(&outputs));
        coinb2.extend_from_slice(&0u32.to_le_bytes());

        Ok((coinb1, coinb2))
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn template(&self) -> &BlockTemplate {
        &self.template
    }

    pub fn height(&self) -> u64 {
        self.template.height
    }

    /// Previous block hash as reported by the node
    pub fn previous_block_hash(&self) -> &str {
        &self.template.previousblockhash
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// Network difficulty of the template
    pub fn block_diff(&self) -> f64 {
        self.block_diff
    }

    /// Broadcastable `mining.notify` parameters
    pub fn job_params(&self) -> JobParams {
        // Stratum sends the previous hash as 4-byte words with bytes swapped
        let prevhash: Vec<u8> = self
            .previous_hash
            .chunks(4)
            .flat_map(|word| word.iter().rev().copied())
            .collect();

        JobParams {
            job_id: self.job_id.clone(),
            prevhash: hex::encode(prevhash),
            coinb1: hex::encode(&self.coinb1),
            coinb2: hex::encode(&self.coinb2),
            merkle_branch: self.merkle_branch.iter().map(hex::encode).collect(),
            version: format!("{:08x}", self.template.version),
            nbits: format!("{:08x}", self.bits),
            ntime: format!("{:08x}", self.template.curtime),
            clean_jobs: true,
        }
    }

    /// Full legacy coinbase serialization
    pub fn serialize_coinbase(&self, extra_nonce1: &[u8], extra_nonce2: &[u8]) -> Vec<u8> {
        let mut coinbase = Vec::with_capacity(
            self.coinb1.len() + extra_nonce1.len() + extra_nonce2.len() + self.coinb2.len(),
        );
        coinbase.extend_from_slice(&self.coinb1);
        coinbase.extend_from_slice(extra_nonce1);
        coinbase.extend_from_slice(extra_nonce2);
        coinbase.extend_from_slice(&self.coinb2);
        coinbase
    }

    pub fn merkle_root(&self, coinbase_hash: [u8; 32]) -> [u8; 32] {
        self.merkle_branch.iter().fold(coinbase_hash, |root, step| {
            let mut joined = [0u8; 64];
            joined[..32].copy_from_slice(&root);
            joined[32..].copy_from_slice(step);
            sha256d(&joined)
        })
    }

    pub fn serialize_header(&self, merkle_root: &[u8; 32], ntime: u32, nonce: u32) -> [u8; 80] {
        let mut header = [0u8; 80];
        header[0..4].copy_from_slice(&self.template.version.to_le_bytes());
        header[4..36].copy_from_slice(&self.previous_hash);
        header[36..68].copy_from_slice(merkle_root);
        header[68..72].copy_from_slice(&ntime.to_le_bytes());
        header[72..76].copy_from_slice(&self.bits.to_le_bytes());
        header[76..80].copy_from_slice(&nonce.to_le_bytes());
        header
    }

    /// Serialize a full block around a solved header
    pub fn serialize_block(&self, header: &[u8; 80], coinbase: &[u8]) -> Result<Vec<u8>> {
        let mut block = Vec::new();
        block.extend_from_slice(header);
        block.extend_from_slice(&serialize(&VarInt(self.template.transactions.len() as u64 + 1)));

        if self.template.default_witness_commitment.is_some() {
            // Segwit coinbase: marker, flag and a single 32-byte reserved witness
            block.extend_from_slice(&coinbase[..4]);
            block.extend_from_slice(&[0x00, 0x01]);
            block.extend_from_slice(&coinbase[4..coinbase.len() - 4]);
            block.extend_from_slice(&[0x01, 0x20]);
            block.extend_from_slice(&[0u8; 32]);
            block.extend_from_slice(&coinbase[coinbase.len() - 4..]);
        } else {
            block.extend_from_slice(coinbase);
        }

        for tx in &self.template.transactions {
            block.extend_from_slice(&hex::decode(&tx.data)?);
        }

        Ok(block)
    }
}
