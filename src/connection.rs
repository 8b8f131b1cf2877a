use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use uuid::Uuid;

use crate::codec::{Error, RequestCodec};
use crate::frame::Frame;
use crate::request::Request;

/// One client socket. Data is read from the socket into the codec's read buffer, and a request
/// is handed out once it has been fully received. Replies are written and flushed one by one.
pub struct Connection {
    pub id: Uuid,
    framed: Framed<TcpStream, RequestCodec>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Connection {
        Self::with_codec(stream, RequestCodec::default())
    }

    pub fn with_codec(stream: TcpStream, codec: RequestCodec) -> Connection {
        Connection {
            id: Uuid::new_v4(),
            framed: Framed::new(stream, codec),
        }
    }

    /// Waits for the next request. `None` means the peer closed the connection cleanly.
    pub async fn read_request(&mut self) -> Result<Option<Request>, Error> {
        self.framed.next().await.transpose()
    }

    pub async fn write_frame(&mut self, frame: Frame) -> Result<(), Error> {
        self.framed.send(frame).await
    }
}
