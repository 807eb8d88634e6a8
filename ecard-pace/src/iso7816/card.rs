use std::fmt;

use tracing::trace;

use crate::iso7816::apdu;


/// An error raised by the transport beneath a [`Dispatcher`].
pub type TransportError = Box<dyn std::error::Error + Send + Sync + 'static>;


/// Identifies the card slot (reader and channel) a command is addressed to.
#[derive(Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SlotHandle(Vec<u8>);
impl SlotHandle {
    pub fn new(handle: impl Into<Vec<u8>>) -> Self {
        Self(handle.into())
    }

    pub fn as_bytes(&self) -> &[u8] { &self.0 }
}
impl fmt::Debug for SlotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotHandle({})", hex::encode_upper(&self.0))
    }
}


#[derive(Debug, thiserror::Error)]
pub enum CommunicationError {
    #[error("APDU error: {0}")]
    Apdu(#[from] apdu::Error),

    #[error("transport error: {0}")]
    Transport(TransportError),
}


/// Exchanges raw APDUs with a smart card compatible with ISO/IEC 7816.
///
/// Implementations block until the card has answered; timeouts and cancellation are the
/// implementation's business.
pub trait Dispatcher {
    /// Sends the encoded command APDU to the card in the given slot and returns the raw response
    /// APDU, including the status word.
    fn transmit(&mut self, slot: &SlotHandle, command: &[u8]) -> Result<Vec<u8>, TransportError>;
}
impl<D: Dispatcher + ?Sized> Dispatcher for &mut D {
    fn transmit(&mut self, slot: &SlotHandle, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        (**self).transmit(slot, command)
    }
}


/// Encodes the command, sends it through the dispatcher and decodes the response.
pub fn communicate<D: Dispatcher + ?Sized>(
    dispatcher: &mut D,
    slot: &SlotHandle,
    request: &apdu::CommandApdu,
) -> Result<apdu::Response, CommunicationError> {
    let out_buf = request.to_bytes();
    trace!(?slot, command = %hex::encode_upper(&out_buf), "sending to card");
    let in_buf = dispatcher.transmit(slot, &out_buf)
        .map_err(CommunicationError::Transport)?;
    trace!(?slot, response = %hex::encode_upper(&in_buf), "received from card");
    Ok(apdu::Response::from_bytes(&in_buf)?)
}
