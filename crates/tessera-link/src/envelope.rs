//! Wire format of the perfect link.
//!
//! Every datagram carries exactly one postcard-encoded [`Envelope`]. The
//! signature covers `(sender, incarnation, message_id, frame)`; it is
//! produced with the sender's roster key, so a receiver that knows the
//! roster can attribute every frame, acknowledgements included.
//!
//! The incarnation is fixed when a link starts. Message ids restart at 1
//! in each incarnation, so a restarted sender is not mistaken for a
//! replay of its previous life.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tessera_crypto::{SigningKey, VerifyingKey};
use tessera_types::{MessageId, PeerId};

use crate::error::{LinkError, LinkResult};

/// Application payloads a link can carry.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// What an envelope carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame<P> {
    /// Application data, acknowledged by the receiver.
    Data(P),
    /// Acknowledges data frame `message_id` sent by the receiver of this
    /// ack during its incarnation `incarnation`.
    Ack { incarnation: u64 },
}

/// A signed link frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<P> {
    pub sender: PeerId,
    pub incarnation: u64,
    pub message_id: MessageId,
    pub frame: Frame<P>,
    pub signature: Vec<u8>,
}

impl<P: Payload> Envelope<P> {
    /// Builds and signs an envelope.
    pub fn sign(
        sender: PeerId,
        incarnation: u64,
        message_id: MessageId,
        frame: Frame<P>,
        key: &SigningKey,
    ) -> LinkResult<Self> {
        let bytes = signing_bytes(&sender, incarnation, message_id, &frame)?;
        let signature = key.sign(&bytes).to_vec();
        Ok(Self {
            sender,
            incarnation,
            message_id,
            frame,
            signature,
        })
    }

    /// Checks the signature against the sender's roster key.
    pub fn verify(&self, key: &VerifyingKey) -> LinkResult<()> {
        let bytes = signing_bytes(&self.sender, self.incarnation, self.message_id, &self.frame)?;
        key.verify_bytes(&bytes, &self.signature)
            .map_err(|_| LinkError::AuthenticationFailure(self.sender.clone()))
    }

    pub fn encode(&self) -> LinkResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> LinkResult<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

fn signing_bytes<P: Serialize>(
    sender: &PeerId,
    incarnation: u64,
    message_id: MessageId,
    frame: &Frame<P>,
) -> LinkResult<Vec<u8>> {
    Ok(postcard::to_allocvec(&(sender, incarnation, message_id, frame))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed(key: &SigningKey, frame: Frame<String>) -> Envelope<String> {
        Envelope::sign(PeerId::new("R1"), 42, MessageId::new(7), frame, key).unwrap()
    }

    #[test]
    fn signed_envelope_verifies_after_decode() {
        let key = SigningKey::generate();
        let envelope = signed(&key, Frame::Data("hello".to_string()));

        let decoded = Envelope::<String>::decode(&envelope.encode().unwrap()).unwrap();
        decoded.verify(&key.verifying_key()).unwrap();
        assert_eq!(decoded.frame, Frame::Data("hello".to_string()));
        assert_eq!(decoded.message_id, MessageId::new(7));
        assert_eq!(decoded.incarnation, 42);
    }

    #[test]
    fn tampered_payload_fails_authentication() {
        let key = SigningKey::generate();
        let mut envelope = signed(&key, Frame::Data("hello".to_string()));
        envelope.frame = Frame::Data("hellp".to_string());

        let err = envelope.verify(&key.verifying_key()).unwrap_err();
        assert!(matches!(err, LinkError::AuthenticationFailure(_)));
    }

    #[test]
    fn impersonated_sender_fails_authentication() {
        let attacker = SigningKey::generate();
        let victim = SigningKey::generate();
        let envelope = signed(&attacker, Frame::Ack { incarnation: 1 });

        assert!(envelope.verify(&victim.verifying_key()).is_err());
    }

    #[test]
    fn rewritten_header_fails_authentication() {
        let key = SigningKey::generate();

        let mut envelope = signed(&key, Frame::Ack { incarnation: 1 });
        envelope.message_id = MessageId::new(8);
        assert!(envelope.verify(&key.verifying_key()).is_err());

        let mut envelope = signed(&key, Frame::Ack { incarnation: 1 });
        envelope.incarnation = 43;
        assert!(envelope.verify(&key.verifying_key()).is_err());
    }

    #[test]
    fn ack_frames_decode_under_any_payload_type() {
        let key = SigningKey::generate();
        let ack = Envelope::<String>::sign(
            PeerId::new("R2"),
            1,
            MessageId::new(3),
            Frame::Ack { incarnation: 9 },
            &key,
        )
        .unwrap();

        let decoded = Envelope::<Vec<u64>>::decode(&ack.encode().unwrap()).unwrap();
        decoded.verify(&key.verifying_key()).unwrap();
        assert_eq!(decoded.frame, Frame::Ack { incarnation: 9 });
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(matches!(
            Envelope::<String>::decode(&[0xff, 0xff, 0xff]),
            Err(LinkError::Codec(_))
        ));
    }
}
