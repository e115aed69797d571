use chrono::Utc;

use crate::address::Address;
use crate::envelope::{MessageEnvelope, Party};

/// The two channel flavours and their addressing.
///
/// A node channel talks to another mesh node identified by its signer; an
/// account channel talks to one device (signer) of a registered account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Node {
        signer: Address,
    },
    Account {
        account: Address,
        signer: Address,
    },
}

impl ChannelKind {
    pub fn node(signer: Address) -> Self {
        ChannelKind::Node { signer }
    }

    pub fn account(account: Address, signer: Address) -> Self {
        ChannelKind::Account { account, signer }
    }

    /// The counterpart's signing address.
    pub fn destination_signer(&self) -> &Address {
        match self {
            ChannelKind::Node { signer } => signer,
            ChannelKind::Account { signer, .. } => signer,
        }
    }

    /// The registered account address, for account channels.
    pub fn destination_account(&self) -> Option<&Address> {
        match self {
            ChannelKind::Node { .. } => None,
            ChannelKind::Account { account, .. } => Some(account),
        }
    }

    /// How the counterpart appears in envelopes we send.
    pub fn receiver_party(&self) -> Party {
        match self {
            ChannelKind::Node { signer } => Party::node(signer.clone()),
            ChannelKind::Account { account, signer } => {
                Party::account(account, signer.clone())
            }
        }
    }

    /// How we appear in envelopes we send: always the local node identity.
    pub fn sender_party(&self, local_signer: &Address) -> Party {
        Party::node(local_signer.clone())
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChannelKind::Node { .. } => "node",
            ChannelKind::Account { .. } => "account",
        }
    }

    /// Admission check for envelopes arriving on this channel.
    ///
    /// Both kinds require the sender to be this channel's counterpart signer
    /// and the receiver to be us; account channels additionally require the
    /// registered account to match and the envelope to be unexpired.
    pub fn admit(&self, envelope: &MessageEnvelope, local_signer: &Address) -> Result<(), String> {
        if envelope.sender.signer != *self.destination_signer() {
            return Err(format!(
                "sender signer {} is not the channel counterpart {}",
                envelope.sender.signer,
                self.destination_signer()
            ));
        }
        if envelope.receiver.signer != *local_signer {
            return Err(format!(
                "receiver signer {} is not the local signer",
                envelope.receiver.signer
            ));
        }
        if let ChannelKind::Account { account, .. } = self {
            match envelope.sender.account_address() {
                Some(sender_account) if sender_account == *account => {}
                _ => {
                    return Err(format!(
                        "sender account {:?} does not match registered account {}",
                        envelope.sender.account, account
                    ))
                }
            }
            if envelope.is_expired(Utc::now().timestamp()) {
                return Err("envelope expired".into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Payload;

    fn addr(c: char) -> Address {
        c.to_string().repeat(40).parse().unwrap()
    }

    fn envelope(sender: Party, receiver: Party) -> MessageEnvelope {
        MessageEnvelope::build(sender, receiver, Payload::Broadcast { text: "x".into() }, 1)
    }

    #[test]
    fn node_addressing_marks_counterpart_as_node() {
        let kind = ChannelKind::node(addr('b'));
        let receiver = kind.receiver_party();
        assert!(receiver.is_node());
        assert_eq!(receiver.signer, addr('b'));

        let sender = kind.sender_party(&addr('a'));
        assert!(sender.is_node());
        assert_eq!(sender.signer, addr('a'));
    }

    #[test]
    fn account_addressing_carries_account_and_device() {
        let kind = ChannelKind::account(addr('c'), addr('d'));
        let receiver = kind.receiver_party();
        assert!(!receiver.is_node());
        assert_eq!(receiver.account, addr('c').to_string());
        assert_eq!(receiver.signer, addr('d'));
    }

    #[test]
    fn node_admission_requires_matching_signers() {
        let local = addr('a');
        let kind = ChannelKind::node(addr('b'));

        let good = envelope(Party::node(addr('b')), Party::node(local.clone()));
        assert!(kind.admit(&good, &local).is_ok());

        let wrong_sender = envelope(Party::node(addr('c')), Party::node(local.clone()));
        assert!(kind.admit(&wrong_sender, &local).is_err());

        let wrong_receiver = envelope(Party::node(addr('b')), Party::node(addr('c')));
        assert!(kind.admit(&wrong_receiver, &local).is_err());
    }

    #[test]
    fn account_admission_checks_account_and_expiry() {
        let local = addr('a');
        let kind = ChannelKind::account(addr('c'), addr('d'));

        let good = envelope(
            Party::account(&addr('c'), addr('d')),
            Party::node(local.clone()),
        );
        assert!(kind.admit(&good, &local).is_ok());

        let wrong_account = envelope(
            Party::account(&addr('e'), addr('d')),
            Party::node(local.clone()),
        );
        assert!(kind.admit(&wrong_account, &local).is_err());

        let mut stale = envelope(
            Party::account(&addr('c'), addr('d')),
            Party::node(local.clone()),
        );
        stale.timestamp -= 3_600;
        assert!(kind.admit(&stale, &local).is_err());
    }
}
