use std::fmt;
use std::str::FromStr;

use crate::{NetworkError, NodeId, Result};

pub const JOIN_TOKEN: &str = "JOIN";
pub const LIST_TOKEN: &str = "LIST";
pub const STORE_TOKEN: &str = "STORE";
pub const STORE_TO_TOKEN: &str = "STORE_TO";
pub const ACK_TOKEN: &str = "ACK";
pub const STORE_ACK_TOKEN: &str = "STORE_ACK";
pub const STORE_COMPLETE_TOKEN: &str = "STORE_COMPLETE";
pub const LOAD_TOKEN: &str = "LOAD";
pub const LOAD_FROM_TOKEN: &str = "LOAD_FROM";
pub const RELOAD_TOKEN: &str = "RELOAD";
pub const LOAD_DATA_TOKEN: &str = "LOAD_DATA";
pub const REMOVE_TOKEN: &str = "REMOVE";
pub const REMOVE_ACK_TOKEN: &str = "REMOVE_ACK";
pub const REMOVE_COMPLETE_TOKEN: &str = "REMOVE_COMPLETE";
pub const REBALANCE_TOKEN: &str = "REBALANCE";
pub const REBALANCE_STORE_TOKEN: &str = "REBALANCE_STORE";
pub const REBALANCE_COMPLETE_TOKEN: &str = "REBALANCE_COMPLETE";

/// Application-level failures reported back to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    FileDoesNotExist,
    FileAlreadyExists,
    NotEnoughDstores,
    Load,
}

impl ErrorCode {
    pub fn token(&self) -> &'static str {
        match self {
            ErrorCode::FileDoesNotExist => "ERROR_FILE_DOES_NOT_EXIST",
            ErrorCode::FileAlreadyExists => "ERROR_FILE_ALREADY_EXISTS",
            ErrorCode::NotEnoughDstores => "ERROR_NOT_ENOUGH_DSTORES",
            ErrorCode::Load => "ERROR_LOAD",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "ERROR_FILE_DOES_NOT_EXIST" => Some(ErrorCode::FileDoesNotExist),
            "ERROR_FILE_ALREADY_EXISTS" => Some(ErrorCode::FileAlreadyExists),
            "ERROR_NOT_ENOUGH_DSTORES" => Some(ErrorCode::NotEnoughDstores),
            "ERROR_LOAD" => Some(ErrorCode::Load),
            _ => None,
        }
    }
}

/// Per-node payload of a REBALANCE command: which local files to copy to
/// which peers, and which local files to delete afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceInstruction {
    pub to_send: Vec<(String, Vec<NodeId>)>,
    pub to_remove: Vec<String>,
}

impl RebalanceInstruction {
    pub fn is_empty(&self) -> bool {
        self.to_send.is_empty() && self.to_remove.is_empty()
    }

    pub fn transfer_count(&self) -> usize {
        self.to_send.iter().map(|(_, peers)| peers.len()).sum()
    }
}

/// Every line exchanged between clients, storage nodes and the controller.
///
/// `LIST` doubles as the client request and the (possibly empty) listing
/// reply; which one is meant depends on who sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Join(NodeId),
    List(Vec<String>),
    Store { name: String, size: u64 },
    StoreTo(Vec<NodeId>),
    Ack,
    StoreAck(String),
    StoreComplete,
    Load(String),
    LoadFrom { node: NodeId, size: u64 },
    Reload(String),
    LoadData(String),
    Remove(String),
    RemoveAck(String),
    RemoveComplete,
    Rebalance(RebalanceInstruction),
    RebalanceStore { name: String, size: u64 },
    RebalanceComplete,
    Error { code: ErrorCode, file: Option<String> },
}

impl Message {
    pub fn error(code: ErrorCode) -> Self {
        Message::Error { code, file: None }
    }

    pub fn token(&self) -> &'static str {
        match self {
            Message::Join(_) => JOIN_TOKEN,
            Message::List(_) => LIST_TOKEN,
            Message::Store { .. } => STORE_TOKEN,
            Message::StoreTo(_) => STORE_TO_TOKEN,
            Message::Ack => ACK_TOKEN,
            Message::StoreAck(_) => STORE_ACK_TOKEN,
            Message::StoreComplete => STORE_COMPLETE_TOKEN,
            Message::Load(_) => LOAD_TOKEN,
            Message::LoadFrom { .. } => LOAD_FROM_TOKEN,
            Message::Reload(_) => RELOAD_TOKEN,
            Message::LoadData(_) => LOAD_DATA_TOKEN,
            Message::Remove(_) => REMOVE_TOKEN,
            Message::RemoveAck(_) => REMOVE_ACK_TOKEN,
            Message::RemoveComplete => REMOVE_COMPLETE_TOKEN,
            Message::Rebalance(_) => REBALANCE_TOKEN,
            Message::RebalanceStore { .. } => REBALANCE_STORE_TOKEN,
            Message::RebalanceComplete => REBALANCE_COMPLETE_TOKEN,
            Message::Error { code, .. } => code.token(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())?;
        match self {
            Message::Join(node) => write!(f, " {}", node),
            Message::List(files) => {
                for file in files {
                    write!(f, " {}", file)?;
                }
                Ok(())
            }
            Message::Store { name, size } | Message::RebalanceStore { name, size } => {
                write!(f, " {} {}", name, size)
            }
            Message::StoreTo(nodes) => {
                for node in nodes {
                    write!(f, " {}", node)?;
                }
                Ok(())
            }
            Message::StoreAck(name)
            | Message::Load(name)
            | Message::Reload(name)
            | Message::LoadData(name)
            | Message::Remove(name)
            | Message::RemoveAck(name) => write!(f, " {}", name),
            Message::LoadFrom { node, size } => write!(f, " {} {}", node, size),
            Message::Rebalance(instruction) => {
                write!(f, " {}", instruction.to_send.len())?;
                for (name, peers) in &instruction.to_send {
                    write!(f, " {} {}", name, peers.len())?;
                    for peer in peers {
                        write!(f, " {}", peer)?;
                    }
                }
                write!(f, " {}", instruction.to_remove.len())?;
                for name in &instruction.to_remove {
                    write!(f, " {}", name)?;
                }
                Ok(())
            }
            Message::Error { file: Some(name), .. } => write!(f, " {}", name),
            Message::Ack
            | Message::StoreComplete
            | Message::RemoveComplete
            | Message::RebalanceComplete
            | Message::Error { file: None, .. } => Ok(()),
        }
    }
}

impl FromStr for Message {
    type Err = NetworkError;

    fn from_str(line: &str) -> Result<Self> {
        let mut tokens = Tokens::new(line);
        let head = tokens.next_str("message token")?;

        let message = match head {
            JOIN_TOKEN => Message::Join(tokens.next_parsed("port")?),
            LIST_TOKEN => Message::List(tokens.rest()),
            STORE_TOKEN => Message::Store {
                name: tokens.next_string("filename")?,
                size: tokens.next_parsed("filesize")?,
            },
            STORE_TO_TOKEN => Message::StoreTo(
                tokens
                    .rest()
                    .iter()
                    .map(|port| parse_token(port, "port"))
                    .collect::<Result<Vec<_>>>()?,
            ),
            ACK_TOKEN => Message::Ack,
            STORE_ACK_TOKEN => Message::StoreAck(tokens.next_string("filename")?),
            STORE_COMPLETE_TOKEN => Message::StoreComplete,
            LOAD_TOKEN => Message::Load(tokens.next_string("filename")?),
            LOAD_FROM_TOKEN => Message::LoadFrom {
                node: tokens.next_parsed("port")?,
                size: tokens.next_parsed("filesize")?,
            },
            RELOAD_TOKEN => Message::Reload(tokens.next_string("filename")?),
            LOAD_DATA_TOKEN => Message::LoadData(tokens.next_string("filename")?),
            REMOVE_TOKEN => Message::Remove(tokens.next_string("filename")?),
            REMOVE_ACK_TOKEN => Message::RemoveAck(tokens.next_string("filename")?),
            REMOVE_COMPLETE_TOKEN => Message::RemoveComplete,
            REBALANCE_TOKEN => Message::Rebalance(parse_rebalance(&mut tokens)?),
            REBALANCE_STORE_TOKEN => Message::RebalanceStore {
                name: tokens.next_string("filename")?,
                size: tokens.next_parsed("filesize")?,
            },
            REBALANCE_COMPLETE_TOKEN => Message::RebalanceComplete,
            other => match ErrorCode::from_token(other) {
                Some(code) => Message::Error {
                    code,
                    file: tokens.next_str("filename").ok().map(str::to_string),
                },
                None => {
                    return Err(NetworkError::Protocol(format!("unknown token {:?}", other)))
                }
            },
        };

        tokens.finish()?;
        Ok(message)
    }
}

fn parse_rebalance(tokens: &mut Tokens<'_>) -> Result<RebalanceInstruction> {
    let send_count: usize = tokens.next_parsed("files to send")?;
    let mut to_send = Vec::new();
    for _ in 0..send_count {
        let name = tokens.next_string("filename")?;
        let peer_count: usize = tokens.next_parsed("peer count")?;
        let peers = (0..peer_count)
            .map(|_| tokens.next_parsed("port"))
            .collect::<Result<Vec<NodeId>>>()?;
        to_send.push((name, peers));
    }

    let remove_count: usize = tokens.next_parsed("files to remove")?;
    let to_remove = (0..remove_count)
        .map(|_| tokens.next_string("filename"))
        .collect::<Result<Vec<_>>>()?;

    Ok(RebalanceInstruction { to_send, to_remove })
}

fn parse_token<T: FromStr>(token: &str, what: &str) -> Result<T> {
    token
        .parse()
        .map_err(|_| NetworkError::Protocol(format!("invalid {}: {:?}", what, token)))
}

struct Tokens<'a> {
    inner: std::str::SplitWhitespace<'a>,
}

impl<'a> Tokens<'a> {
    fn new(line: &'a str) -> Self {
        Self {
            inner: line.split_whitespace(),
        }
    }

    fn next_str(&mut self, what: &str) -> Result<&'a str> {
        self.inner
            .next()
            .ok_or_else(|| NetworkError::Protocol(format!("missing {}", what)))
    }

    fn next_string(&mut self, what: &str) -> Result<String> {
        self.next_str(what).map(str::to_string)
    }

    fn next_parsed<T: FromStr>(&mut self, what: &str) -> Result<T> {
        let token = self.next_str(what)?;
        parse_token(token, what)
    }

    fn rest(&mut self) -> Vec<String> {
        self.inner.by_ref().map(str::to_string).collect()
    }

    fn finish(mut self) -> Result<()> {
        match self.inner.next() {
            Some(extra) => Err(NetworkError::Protocol(format!(
                "unexpected trailing token {:?}",
                extra
            ))),
            None => Ok(()),
        }
    }
}
