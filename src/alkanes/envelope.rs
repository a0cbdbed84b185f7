// Alkanes envelope implementation based on ord protocol
// Reveal scripts commit to the payload in a BIN-tagged envelope behind a
// single key check, so only the holder of the internal key can reveal.

use bitcoin::{
    opcodes::{self, OP_FALSE},
    script::{Builder as ScriptBuilder, Instruction, PushBytes},
    secp256k1::Secp256k1,
    taproot::{ControlBlock, LeafVersion, TaprootBuilder, TaprootSpendInfo},
    Address, Network, Script, ScriptBuf, XOnlyPublicKey,
};
use flate2::{write::GzEncoder, Compression};
use log::debug;
use std::io::Write;

use crate::{AlkanesError, Result};

// Alkanes protocol constants - based on ord but with BIN tag
pub const ALKANES_PROTOCOL_ID: [u8; 3] = *b"BIN";
pub const BODY_TAG: [u8; 0] = [];
pub const CONTENT_TYPE_TAG: [u8; 1] = [1];
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// Payload inscribed by a commit/reveal pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlkanesPayload {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

impl AlkanesPayload {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            content_type: None,
        }
    }

    /// Gzip contract bytecode for deployment
    pub fn from_wasm(wasm: &[u8]) -> Result<Self> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(wasm)?;
        let body = encoder.finish()?;
        debug!("Compressed {} bytes of bytecode to {} bytes", wasm.len(), body.len());
        Ok(Self::new(body))
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

fn push_bytes(data: &[u8]) -> Result<&PushBytes> {
    <&PushBytes>::try_from(data).map_err(|_| {
        AlkanesError::Encoding(format!("script push of {} bytes is too large", data.len()))
    })
}

/// Build the reveal script `<key> OP_CHECKSIG OP_FALSE OP_IF "BIN" ... OP_ENDIF`
pub fn build_reveal_script(
    internal_key: &XOnlyPublicKey,
    payload: &AlkanesPayload,
) -> Result<ScriptBuf> {
    let mut builder = ScriptBuilder::new()
        .push_x_only_key(internal_key)
        .push_opcode(opcodes::all::OP_CHECKSIG)
        .push_opcode(OP_FALSE)
        .push_opcode(opcodes::all::OP_IF)
        .push_slice(push_bytes(&ALKANES_PROTOCOL_ID)?);

    if let Some(content_type) = &payload.content_type {
        builder = builder
            .push_slice(push_bytes(&CONTENT_TYPE_TAG)?)
            .push_slice(push_bytes(content_type.as_bytes())?);
    }

    builder = builder.push_slice(push_bytes(&BODY_TAG)?);
    for chunk in payload.body.chunks(MAX_SCRIPT_ELEMENT_SIZE) {
        builder = builder.push_slice(push_bytes(chunk)?);
    }

    Ok(builder.push_opcode(opcodes::all::OP_ENDIF).into_script())
}

/// Parse the payload back out of a reveal script
pub fn parse_reveal_script(script: &Script) -> Option<AlkanesPayload> {
    let mut instructions = script.instructions().skip_while(|instruction| {
        !matches!(instruction, Ok(Instruction::Op(opcodes::all::OP_CHECKSIG)))
    });
    instructions.next()?;

    // OP_FALSE is yielded as an empty push
    match instructions.next()? {
        Ok(Instruction::PushBytes(bytes)) if bytes.is_empty() => {}
        _ => return None,
    }
    if !matches!(instructions.next()?, Ok(Instruction::Op(opcodes::all::OP_IF))) {
        return None;
    }
    match instructions.next()? {
        Ok(Instruction::PushBytes(bytes)) if bytes.as_bytes() == ALKANES_PROTOCOL_ID => {}
        _ => return None,
    }

    let mut content_type = None;
    let mut body = Vec::new();
    let mut in_body = false;
    while let Some(instruction) = instructions.next() {
        match instruction.ok()? {
            Instruction::Op(opcodes::all::OP_ENDIF) => {
                return Some(AlkanesPayload { body, content_type });
            }
            Instruction::PushBytes(bytes) if in_body => body.extend_from_slice(bytes.as_bytes()),
            Instruction::PushBytes(bytes) if bytes.is_empty() => in_body = true,
            Instruction::PushBytes(bytes) if bytes.as_bytes() == CONTENT_TYPE_TAG => {
                if let Some(Ok(Instruction::PushBytes(value))) = instructions.next() {
                    content_type = Some(String::from_utf8_lossy(value.as_bytes()).into_owned());
                }
            }
            _ => {}
        }
    }
    None
}

/// Taproot output committing to a single reveal script leaf
#[derive(Debug, Clone)]
pub struct TaprootScriptInfo {
    pub internal_key: XOnlyPublicKey,
    pub reveal_script: ScriptBuf,
    pub spend_info: TaprootSpendInfo,
    pub address: Address,
    pub control_block: ControlBlock,
}

impl TaprootScriptInfo {
    pub fn new(
        internal_key: XOnlyPublicKey,
        reveal_script: ScriptBuf,
        network: Network,
    ) -> Result<Self> {
        let secp = Secp256k1::verification_only();
        let spend_info = TaprootBuilder::new()
            .add_leaf(0, reveal_script.clone())?
            .finalize(&secp, internal_key)
            .map_err(|_| AlkanesError::Taproot("failed to finalize taproot tree".to_string()))?;
        let control_block = spend_info
            .control_block(&(reveal_script.clone(), LeafVersion::TapScript))
            .ok_or_else(|| {
                AlkanesError::Taproot("reveal script missing from taproot tree".to_string())
            })?;
        let address = Address::p2tr_tweaked(spend_info.output_key(), network);

        Ok(Self {
            internal_key,
            reveal_script,
            spend_info,
            address,
            control_block,
        })
    }

    /// Derive the commit output for a payload under `internal_key`
    pub fn for_payload(
        internal_key: XOnlyPublicKey,
        payload: &AlkanesPayload,
        network: Network,
    ) -> Result<Self> {
        let reveal_script = build_reveal_script(&internal_key, payload)?;
        Self::new(internal_key, reveal_script, network)
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }
}
