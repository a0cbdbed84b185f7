//! Protostone message encoding
//!
//! A protostone is carried in the `protocol` field of a Runestone. The
//! protostone list is enciphered into u128 values by `protorune-support`
//! before the Runestone is enciphered into an OP_RETURN script.

use alkanes_support::cellpack::Cellpack;
use bitcoin::{ScriptBuf, Transaction};
use ordinals::{Artifact, Runestone};
use protorune_support::balance_sheet::ProtoruneRuneId;
use protorune_support::protostone::{self, Protostone, Protostones};
use protorune_support::utils::encode_varint_list;
use serde::{Deserialize, Serialize};

use crate::{AlkanesError, Result};

/// Protocol tag of the alkanes subprotocol
pub const ALKANES_PROTOCOL_TAG: u128 = 1;

/// Transfer of an alkane balance to an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtostoneEdict {
    /// Alkane ID block
    pub block: u128,
    /// Alkane ID tx
    pub tx: u128,
    /// Amount to transfer
    pub amount: u128,
    /// Output receiving the amount
    pub output: u32,
}

impl From<ProtostoneEdict> for protostone::ProtostoneEdict {
    fn from(edict: ProtostoneEdict) -> Self {
        protostone::ProtostoneEdict {
            id: ProtoruneRuneId {
                block: edict.block,
                tx: edict.tx,
            },
            amount: edict.amount,
            output: edict.output as u128,
        }
    }
}

/// Message instructing the alkanes runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtostoneMessage {
    /// Protocol tag (default 1)
    pub protocol_tag: u128,
    /// Transfers applied before the call
    pub edicts: Vec<ProtostoneEdict>,
    /// Output receiving resulting balances
    pub pointer: u32,
    /// Output receiving balances if the call reverts
    pub refund_pointer: u32,
    /// Call data, target alkane first
    pub calldata: Vec<u128>,
}

impl Default for ProtostoneMessage {
    fn default() -> Self {
        Self {
            protocol_tag: ALKANES_PROTOCOL_TAG,
            edicts: Vec::new(),
            pointer: 0,
            refund_pointer: 0,
            calldata: Vec::new(),
        }
    }
}

impl ProtostoneMessage {
    pub fn new(calldata: Vec<u128>) -> Self {
        Self {
            calldata,
            ..Default::default()
        }
    }

    /// Message calling `cellpack.target` with `cellpack.inputs`
    pub fn from_cellpack(cellpack: &Cellpack) -> Self {
        let mut calldata = vec![cellpack.target.block, cellpack.target.tx];
        calldata.extend(cellpack.inputs.iter().copied());
        Self::new(calldata)
    }

    pub fn to_protostone(&self) -> Protostone {
        Protostone {
            burn: None,
            message: encipher_calldata(&self.calldata),
            edicts: self.edicts.iter().copied().map(Into::into).collect(),
            refund: Some(self.refund_pointer),
            pointer: Some(self.pointer),
            from: None,
            protocol_tag: self.protocol_tag,
        }
    }
}

/// LEB128-pack calldata integers
pub fn encipher_calldata(calldata: &[u128]) -> Vec<u8> {
    encode_varint_list(&calldata.to_vec())
}

/// Encode a message into the OP_RETURN Runestone script carrying it
pub fn encode_protostone(message: &ProtostoneMessage) -> Result<ScriptBuf> {
    let protocol = vec![message.to_protostone()].encipher()?;
    let runestone = Runestone {
        edicts: Vec::new(),
        etching: None,
        mint: None,
        pointer: None,
        protocol: Some(protocol),
    };
    Ok(runestone.encipher())
}

/// Decode the protostones carried by a transaction's Runestone
pub fn decode_protostones(tx: &Transaction) -> Result<Vec<Protostone>> {
    match Runestone::decipher(tx) {
        Some(Artifact::Runestone(runestone)) => match runestone.protocol {
            Some(protocol) => Ok(Protostone::decipher(&protocol)?),
            None => Ok(Vec::new()),
        },
        Some(Artifact::Cenotaph(cenotaph)) => Err(AlkanesError::Encoding(format!(
            "runestone is a cenotaph: {cenotaph:?}"
        ))),
        None => Err(AlkanesError::Encoding("transaction carries no runestone".to_string())),
    }
}
