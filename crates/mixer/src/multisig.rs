use sha2::{Digest, Sha256};
use solana_sdk::pubkey::Pubkey;

use crate::error::{MixerError, Result};

const OP_1: u8 = 0x51;
const OP_2: u8 = 0x52;
const OP_CHECKMULTISIG: u8 = 0xae;
const PUSH_32: u8 = 0x20;

/// 1-of-2 spending policy over the custodian key and the master key of one
/// pool index. Either key alone can authorize a transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultisigPolicy {
    keys: [Pubkey; 2],
}

impl MultisigPolicy {
    /// Keys are sorted, so the policy does not depend on argument order.
    pub fn one_of_two(a: Pubkey, b: Pubkey) -> Result<Self> {
        if a == b {
            return Err(MixerError::Crypto("multisig keys must differ".into()));
        }
        let keys = if a.to_bytes() <= b.to_bytes() { [a, b] } else { [b, a] };
        Ok(Self { keys })
    }

    pub fn keys(&self) -> &[Pubkey; 2] {
        &self.keys
    }

    /// `OP_1 <key_a> <key_b> OP_2 OP_CHECKMULTISIG`
    pub fn script(&self) -> Vec<u8> {
        let mut script = Vec::with_capacity(3 + 2 * 33);
        script.push(OP_1);
        for key in &self.keys {
            script.push(PUSH_32);
            script.extend_from_slice(key.as_ref());
        }
        script.push(OP_2);
        script.push(OP_CHECKMULTISIG);
        script
    }

    pub fn script_hash(&self) -> [u8; 32] {
        Sha256::digest(self.script()).into()
    }

    /// Vault address owned by the custody program for this policy.
    pub fn vault_address(&self, custody_program_id: &Pubkey) -> Pubkey {
        let hash = self.script_hash();
        Pubkey::find_program_address(&[b"pool_vault", &hash], custody_program_id).0
    }

    pub fn authorizes(&self, signer: &Pubkey) -> bool {
        self.keys.contains(signer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_is_order_independent() {
        let a = Pubkey::new_unique();
        let b = Pubkey::new_unique();
        let program = Pubkey::new_unique();

        let ab = MultisigPolicy::one_of_two(a, b).unwrap();
        let ba = MultisigPolicy::one_of_two(b, a).unwrap();
        assert_eq!(ab.script(), ba.script());
        assert_eq!(ab.vault_address(&program), ba.vault_address(&program));
    }

    #[test]
    fn test_script_layout() {
        let policy = MultisigPolicy::one_of_two(Pubkey::new_unique(), Pubkey::new_unique()).unwrap();
        let script = policy.script();
        assert_eq!(script.len(), 69);
        assert_eq!(script[0], OP_1);
        assert_eq!(script[67], OP_2);
        assert_eq!(script[68], OP_CHECKMULTISIG);
    }

    #[test]
    fn test_either_key_authorizes() {
        let a = Pubkey::new_unique();
        let b = Pubkey::new_unique();
        let policy = MultisigPolicy::one_of_two(a, b).unwrap();
        assert!(policy.authorizes(&a));
        assert!(policy.authorizes(&b));
        assert!(!policy.authorizes(&Pubkey::new_unique()));
    }

    #[test]
    fn test_distinct_keys_required() {
        let a = Pubkey::new_unique();
        assert!(MultisigPolicy::one_of_two(a, a).is_err());
    }

    #[test]
    fn test_address_depends_on_keys() {
        let program = Pubkey::new_unique();
        let shared = Pubkey::new_unique();
        let p1 = MultisigPolicy::one_of_two(shared, Pubkey::new_unique()).unwrap();
        let p2 = MultisigPolicy::one_of_two(shared, Pubkey::new_unique()).unwrap();
        assert_ne!(p1.vault_address(&program), p2.vault_address(&program));
    }
}
