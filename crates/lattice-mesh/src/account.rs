use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::RngCore;
use sha2::Sha256;

use crate::address::Address;
use crate::error::MeshError;

type HmacSha256 = Hmac<Sha256>;

/// An identity known to the node.
///
/// `Local` is the node's own signer and may carry key material; `External`
/// is a bare counterpart address; `Registered` is an external address with
/// an on-chain display name. Equality is by address only.
#[derive(Debug, Clone)]
pub enum Account {
    Local {
        address: Address,
        key: Option<Vec<u8>>,
        derivation_index: Option<u32>,
    },
    External {
        address: Address,
    },
    Registered {
        address: Address,
        name: String,
    },
}

impl Account {
    pub fn address(&self) -> &Address {
        match self {
            Account::Local { address, .. }
            | Account::External { address }
            | Account::Registered { address, .. } => address,
        }
    }

    /// Zeroize and drop the private key, if any.
    pub fn lock(&mut self) {
        if let Account::Local { key, .. } = self {
            if let Some(material) = key.as_mut() {
                material.fill(0);
            }
            *key = None;
        }
    }

    /// Sign `data` with the sealed key. Fails for locked or non-local
    /// accounts.
    pub fn sign(&self, data: &[u8]) -> Result<String, MeshError> {
        match self {
            Account::Local { key: Some(key), .. } => {
                let mut mac = HmacSha256::new_from_slice(key)
                    .map_err(|err| MeshError::Internal(format!("signer key invalid: {err}")))?;
                mac.update(data);
                Ok(BASE64.encode(mac.finalize().into_bytes()))
            }
            Account::Local { key: None, .. } => {
                Err(MeshError::Internal("signer account is locked".into()))
            }
            _ => Err(MeshError::Internal("not a signer account".into())),
        }
    }
}

impl PartialEq for Account {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for Account {}

/// The node's single signing identity.
///
/// There is exactly one of these per node; it is injected explicitly rather
/// than reached through a global (construction order is the caller's job).
pub struct AccountManager {
    local: RwLock<Account>,
}

impl AccountManager {
    pub fn new(address: Address, key: Vec<u8>) -> Self {
        Self {
            local: RwLock::new(Account::Local {
                address,
                key: Some(key),
                derivation_index: None,
            }),
        }
    }

    /// Derive a manager from raw key material: the address is the first 20
    /// bytes of the key digest.
    pub fn from_key(key: Vec<u8>) -> Self {
        use sha2::Digest;
        let digest = Sha256::digest(&key);
        let hex: String = digest[..20].iter().map(|b| format!("{b:02x}")).collect();
        let address: Address = hex.parse().expect("digest hex is a valid address");
        Self::new(address, key)
    }

    /// A manager with a freshly generated random key.
    pub fn generate() -> Self {
        let mut key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self::from_key(key)
    }

    pub fn address(&self) -> Address {
        self.local.read().address().clone()
    }

    pub fn is_signer(&self, address: &Address) -> bool {
        *self.local.read().address() == *address
    }

    pub fn sign(&self, data: &[u8]) -> Result<String, MeshError> {
        self.local.read().sign(data)
    }

    /// Zeroize the local key. Subsequent `sign` calls fail.
    pub fn lock(&self) {
        self.local.write().lock();
    }
}
