//! Wire protocol: a fixed-width command field followed by a
//! length-framed canonical payload. Every payload starts with the
//! sender's listen address so receivers can learn peers.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::config;
use crate::error::{Error, Result};

/// Fixed width of the zero-padded ASCII command field.
pub const COMMAND_WIDTH: usize = 12;

/// Upper bound on a single payload; anything larger is dropped.
pub const MAX_PAYLOAD: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvKind {
    Block,
    Tx,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionPayload {
    pub addr_from: String,
    pub version: u32,
    pub best_height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrPayload {
    pub addr_from: String,
    pub addrs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvPayload {
    pub addr_from: String,
    pub kind: InvKind,
    pub items: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlocksPayload {
    pub addr_from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDataPayload {
    pub addr_from: String,
    pub kind: InvKind,
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPayload {
    pub addr_from: String,
    #[serde(with = "serde_bytes")]
    pub block: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPayload {
    pub addr_from: String,
    #[serde(with = "serde_bytes")]
    pub transaction: Vec<u8>,
}

/// Every command a node understands, as a tagged variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionPayload),
    Addr(AddrPayload),
    Inv(InvPayload),
    GetBlocks(GetBlocksPayload),
    GetData(GetDataPayload),
    Block(BlockPayload),
    Tx(TxPayload),
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Addr(_) => "addr",
            Message::Inv(_) => "inv",
            Message::GetBlocks(_) => "getblocks",
            Message::GetData(_) => "getdata",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
        }
    }

    /// Frame this message: `command[12] || be32(len) || payload`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let opts = config::bincode_options();
        let payload = match self {
            Message::Version(p) => opts.serialize(p)?,
            Message::Addr(p) => opts.serialize(p)?,
            Message::Inv(p) => opts.serialize(p)?,
            Message::GetBlocks(p) => opts.serialize(p)?,
            Message::GetData(p) => opts.serialize(p)?,
            Message::Block(p) => opts.serialize(p)?,
            Message::Tx(p) => opts.serialize(p)?,
        };

        let mut frame = Vec::with_capacity(COMMAND_WIDTH + 4 + payload.len());
        let mut command = [0u8; COMMAND_WIDTH];
        command[..self.command().len()].copy_from_slice(self.command().as_bytes());
        frame.extend_from_slice(&command);
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Parse a command field and payload back into a message.
    pub fn decode(command: &[u8; COMMAND_WIDTH], payload: &[u8]) -> Result<Self> {
        let end = command
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(COMMAND_WIDTH);
        let name = std::str::from_utf8(&command[..end])
            .map_err(|_| Error::Decode("non-ascii command".into()))?;

        let opts = config::bincode_options();
        let message = match name {
            "version" => Message::Version(opts.deserialize(payload)?),
            "addr" => Message::Addr(opts.deserialize(payload)?),
            "inv" => Message::Inv(opts.deserialize(payload)?),
            "getblocks" => Message::GetBlocks(opts.deserialize(payload)?),
            "getdata" => Message::GetData(opts.deserialize(payload)?),
            "block" => Message::Block(opts.deserialize(payload)?),
            "tx" => Message::Tx(opts.deserialize(payload)?),
            other => return Err(Error::Decode(format!("unknown command {other:?}"))),
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) {
        let frame = message.encode().unwrap();
        let mut command = [0u8; COMMAND_WIDTH];
        command.copy_from_slice(&frame[..COMMAND_WIDTH]);
        let len = u32::from_be_bytes(frame[COMMAND_WIDTH..COMMAND_WIDTH + 4].try_into().unwrap());
        let payload = &frame[COMMAND_WIDTH + 4..];
        assert_eq!(len as usize, payload.len());
        assert_eq!(Message::decode(&command, payload).unwrap(), message);
    }

    #[test]
    fn commands_fit_the_fixed_field() {
        for message in [
            Message::Version(VersionPayload {
                addr_from: "localhost:3001".into(),
                version: 1,
                best_height: 4,
            }),
            Message::GetBlocks(GetBlocksPayload {
                addr_from: "localhost:3001".into(),
            }),
        ] {
            assert!(message.command().len() <= COMMAND_WIDTH);
            round_trip(message);
        }
    }

    #[test]
    fn inv_and_getdata_round_trip() {
        round_trip(Message::Inv(InvPayload {
            addr_from: "localhost:3000".into(),
            kind: InvKind::Block,
            items: vec![vec![1; 32], vec![2; 32]],
        }));
        round_trip(Message::GetData(GetDataPayload {
            addr_from: "localhost:3000".into(),
            kind: InvKind::Tx,
            id: vec![9; 32],
        }));
    }

    #[test]
    fn unknown_commands_are_rejected() {
        let mut command = [0u8; COMMAND_WIDTH];
        command[..4].copy_from_slice(b"ping");
        assert!(matches!(
            Message::decode(&command, &[]),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn truncated_payloads_are_rejected() {
        let message = Message::Version(VersionPayload {
            addr_from: "localhost:3000".into(),
            version: 1,
            best_height: 0,
        });
        let frame = message.encode().unwrap();
        let mut command = [0u8; COMMAND_WIDTH];
        command.copy_from_slice(&frame[..COMMAND_WIDTH]);
        let payload = &frame[COMMAND_WIDTH + 4..frame.len() - 1];
        assert!(Message::decode(&command, payload).is_err());
    }
}
