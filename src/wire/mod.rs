use protocol::Envelope;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{self, Framed};

pub mod decoder;
pub mod encoder;
pub mod protocol;

/// Wraps a stream in the message codec.
///
/// ```
/// use futures::SinkExt;
/// use tokio_stream::StreamExt;
/// use tokio_test::block_on;
/// use tspool::wire::protocol::{Envelope, Message};
///
/// block_on(async {
///     let (a, b) = tokio::io::duplex(256);
///     let mut tx = tspool::wire::framed(a);
///     let mut rx = tspool::wire::framed(b);
///
///     tx.send(Envelope::new(0, Message::GetVersion)).await.unwrap();
///     assert_eq!(rx.next().await.unwrap().unwrap().msg, Message::GetVersion);
/// });
/// ```
pub fn framed<T: AsyncRead + AsyncWrite>(stream: T) -> Framed<T, Codec> {
    Framed::new(stream, Default::default())
}

#[derive(Default)]
pub struct Codec {
    d: decoder::Decoder,
    e: encoder::Encoder,
}

impl codec::Decoder for Codec {
    type Item = Envelope;

    type Error = decoder::Error;

    fn decode(
        &mut self,
        src: &mut bytes::BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        self.d.decode(src)
    }
}

impl codec::Encoder<Envelope> for Codec {
    type Error = encoder::Error;

    fn encode(
        &mut self,
        item: Envelope,
        dst: &mut bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        self.e.encode(item, dst)
    }
}
