use std::time::Duration;

use bytes::Bytes;
use network::{read_line, write_message, Message, NodeId};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::warn;

use crate::error::ClientError;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Client side of the controller protocol, plus the direct transfers to and
/// from storage nodes that STORE and LOAD require.
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    host: String,
    timeout: Duration,
}

impl Client {
    pub async fn connect(host: &str, controller_port: u16, timeout: Duration) -> ClientResult<Self> {
        let stream = TcpStream::connect((host, controller_port)).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            host: host.to_string(),
            timeout,
        })
    }

    /// Sends one request and waits for the controller's reply. Protocol
    /// error replies come back as [`ClientError::Rejected`].
    pub async fn call(&mut self, request: &Message) -> ClientResult<Message> {
        write_message(&mut self.writer, request).await?;
        self.reply(request.token()).await
    }

    async fn reply(&mut self, awaiting: &str) -> ClientResult<Message> {
        let line = tokio::time::timeout(self.timeout, read_line(&mut self.reader))
            .await
            .map_err(|_| ClientError::Timeout(format!("reply to {}", awaiting)))??
            .ok_or(ClientError::Closed)?;

        match line.parse::<Message>()? {
            Message::Error { code, .. } => Err(ClientError::Rejected(code)),
            message => Ok(message),
        }
    }

    pub async fn list(&mut self) -> ClientResult<Vec<String>> {
        match self.call(&Message::List(Vec::new())).await? {
            Message::List(files) => Ok(files),
            other => Err(ClientError::Unexpected(other.to_string())),
        }
    }

    /// Uploads `data` to every node the controller picks, then waits for the
    /// controller to confirm the store.
    pub async fn store(&mut self, name: &str, data: Bytes) -> ClientResult<()> {
        let request = Message::Store {
            name: name.to_string(),
            size: data.len() as u64,
        };
        let nodes = match self.call(&request).await? {
            Message::StoreTo(nodes) => nodes,
            other => return Err(ClientError::Unexpected(other.to_string())),
        };

        for node in &nodes {
            if let Err(e) = self.upload(*node, name, &data).await {
                warn!(file = %name, node = %node, "upload failed: {}", e);
            }
        }

        match self.reply("STORE_COMPLETE").await? {
            Message::StoreComplete => Ok(()),
            other => Err(ClientError::Unexpected(other.to_string())),
        }
    }

    /// Fetches `name`, stepping to the next replica with RELOAD whenever a
    /// transfer fails. Runs out with `Rejected(FileDoesNotExist)`.
    pub async fn load(&mut self, name: &str) -> ClientResult<Bytes> {
        let mut reply = self.call(&Message::Load(name.to_string())).await?;
        loop {
            let (node, size) = match reply {
                Message::LoadFrom { node, size } => (node, size),
                other => return Err(ClientError::Unexpected(other.to_string())),
            };

            match self.download(node, name, size).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    warn!(file = %name, node = %node, "download failed, trying next replica: {}", e);
                    reply = self.call(&Message::Reload(name.to_string())).await?;
                }
            }
        }
    }

    pub async fn remove(&mut self, name: &str) -> ClientResult<()> {
        match self.call(&Message::Remove(name.to_string())).await? {
            Message::RemoveComplete => Ok(()),
            other => Err(ClientError::Unexpected(other.to_string())),
        }
    }

    async fn upload(&self, node: NodeId, name: &str, data: &Bytes) -> ClientResult<()> {
        let stream = TcpStream::connect((self.host.as_str(), node.0)).await?;
        let mut stream = BufReader::new(stream);

        let header = Message::Store {
            name: name.to_string(),
            size: data.len() as u64,
        };
        write_message(stream.get_mut(), &header).await?;

        let ack = tokio::time::timeout(self.timeout, read_line(&mut stream))
            .await
            .map_err(|_| ClientError::Timeout(format!("ACK from {}", node)))??;
        if ack.as_deref() != Some("ACK") {
            return Err(ClientError::Unexpected(format!("{:?} from {}", ack, node)));
        }

        stream.get_mut().write_all(data).await?;
        stream.get_mut().shutdown().await?;
        Ok(())
    }

    async fn download(&self, node: NodeId, name: &str, size: u64) -> ClientResult<Bytes> {
        let mut stream = TcpStream::connect((self.host.as_str(), node.0)).await?;
        write_message(&mut stream, &Message::LoadData(name.to_string())).await?;

        let mut buffer = Vec::new();
        tokio::time::timeout(self.timeout, (&mut stream).take(size).read_to_end(&mut buffer))
            .await
            .map_err(|_| ClientError::Timeout(format!("data from {}", node)))??;
        if buffer.len() as u64 != size {
            return Err(ClientError::Unexpected(format!(
                "{} bytes of {} from {}, expected {}",
                buffer.len(),
                name,
                node,
                size
            )));
        }
        Ok(Bytes::from(buffer))
    }
}
