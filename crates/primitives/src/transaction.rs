use keeld_consensus::Hash256;

use crate::encoding::{var_int_size, DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// A coinbase has exactly one input referencing the null outpoint.
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.serialized_size());
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_var_int(self.vin.len() as u64);
        for input in &self.vin {
            input.prevout.encode_into(encoder);
            encoder.write_var_bytes(&input.script_sig);
            encoder.write_u32_le(input.sequence);
        }
        encoder.write_var_int(self.vout.len() as u64);
        for output in &self.vout {
            encoder.write_i64_le(output.value);
            encoder.write_var_bytes(&output.script_pubkey);
        }
        encoder.write_u32_le(self.lock_time);
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(tx)
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let input_count = decoder.read_var_int()?;
        let input_count = usize::try_from(input_count).map_err(|_| DecodeError::Overflow)?;
        let mut vin = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            let prevout = OutPoint::decode_from(decoder)?;
            let script_sig = decoder.read_var_bytes()?;
            let sequence = decoder.read_u32_le()?;
            vin.push(TxIn {
                prevout,
                script_sig,
                sequence,
            });
        }
        let output_count = decoder.read_var_int()?;
        let output_count = usize::try_from(output_count).map_err(|_| DecodeError::Overflow)?;
        let mut vout = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            let value = decoder.read_i64_le()?;
            let script_pubkey = decoder.read_var_bytes()?;
            vout.push(TxOut {
                value,
                script_pubkey,
            });
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }

    pub fn serialized_size(&self) -> usize {
        let mut size = 4 + 4;
        size += var_int_size(self.vin.len() as u64);
        for input in &self.vin {
            size += 36 + var_int_size(input.script_sig.len() as u64) + input.script_sig.len() + 4;
        }
        size += var_int_size(self.vout.len() as u64);
        for output in &self.vout {
            size += 8 + var_int_size(output.script_pubkey.len() as u64) + output.script_pubkey.len();
        }
        size
    }

    /// Number of legacy signature operations claimed by this transaction.
    pub fn signature_operations(&self) -> u32 {
        let inputs = self
            .vin
            .iter()
            .map(|input| script_sigops(&input.script_sig));
        let outputs = self
            .vout
            .iter()
            .map(|output| script_sigops(&output.script_pubkey));
        inputs.chain(outputs).sum()
    }
}

const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKSIGVERIFY: u8 = 0xad;
const OP_CHECKMULTISIG: u8 = 0xae;
const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
const MULTISIG_SIGOPS: u32 = 20;

fn script_sigops(script: &[u8]) -> u32 {
    let mut total = 0u32;
    let mut index = 0usize;
    while index < script.len() {
        let opcode = script[index];
        index += 1;
        match opcode {
            1..=75 => index += opcode as usize,
            0x4c => {
                let len = script.get(index).copied().unwrap_or(0) as usize;
                index += 1 + len;
            }
            0x4d => {
                let len = script
                    .get(index..index + 2)
                    .map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]]) as usize)
                    .unwrap_or(0);
                index += 2 + len;
            }
            OP_CHECKSIG | OP_CHECKSIGVERIFY => total = total.saturating_add(1),
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                total = total.saturating_add(MULTISIG_SIGOPS)
            }
            _ => {}
        }
    }
    total
}
