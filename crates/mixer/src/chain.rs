use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{
    hash::Hash,
    instruction::{AccountMeta, Instruction},
    message::Message,
    pubkey::Pubkey,
    signature::Signature,
    system_program::ID as SYSTEM_PROGRAM_ID,
    transaction::Transaction,
};
use solana_transaction_status::TransactionConfirmationStatus;
use tracing::{debug, info};

use crate::custodian::KeyCustodian;
use crate::error::{MixerError, Result};

/// What the ledger knows about a submitted transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainTxStatus {
    NotFound,
    Failed(String),
    /// `confirmations` is `u64::MAX` once finalized.
    Landed { block_height: u64, confirmations: u64 },
}

impl ChainTxStatus {
    pub fn is_confirmed(&self, required: u64) -> bool {
        matches!(self, ChainTxStatus::Landed { confirmations, .. } if *confirmations >= required)
    }
}

/// Transfer out of a pool vault, authorized by the pool's custodian key.
#[derive(Clone, Debug)]
pub struct TransferRequest {
    pub vault: String,
    pub policy_script_hash: [u8; 32],
    pub authority: String,
    pub destination: String,
    pub token: String,
    pub amount: u64,
}

#[derive(Clone, Debug)]
pub enum ProofSubmission {
    /// Request commitment anchored ahead of a dispute.
    Mix {
        request_id: String,
        commitment: [u8; 32],
        signature: Vec<u8>,
    },
    Completion {
        request_id: String,
        merkle_root: [u8; 32],
        signature: Vec<u8>,
        timestamp: i64,
        output_count: u32,
    },
}

/// Message bytes awaiting a single signature from `signer`.
#[derive(Clone, Debug)]
pub struct UnsignedTx {
    pub message: Vec<u8>,
    pub signer: String,
}

#[derive(Clone, Debug)]
pub struct SignedTx {
    pub raw: Vec<u8>,
    pub tx_ref: String,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn get_balance(&self, address: &str) -> Result<u64>;
    async fn build_transfer_tx(&self, transfer: &TransferRequest) -> Result<UnsignedTx>;
    async fn build_proof_tx(&self, submission: &ProofSubmission, payer: &str) -> Result<UnsignedTx>;
    /// Attaches the signature. The returned bytes are final: resending them
    /// can never produce a second transfer.
    fn assemble(&self, unsigned: &UnsignedTx, signature: &[u8]) -> Result<SignedTx>;
    async fn send_transaction(&self, raw: &[u8]) -> Result<String>;
    async fn get_transaction_status(&self, tx_ref: &str) -> Result<ChainTxStatus>;

    async fn submit_mix_proof(
        &self,
        submission: &ProofSubmission,
        custodian: &dyn KeyCustodian,
    ) -> Result<String> {
        self.submit_signed(submission, custodian).await
    }

    async fn submit_completion_proof(
        &self,
        submission: &ProofSubmission,
        custodian: &dyn KeyCustodian,
    ) -> Result<String> {
        self.submit_signed(submission, custodian).await
    }

    /// Builds the proof transaction, has the custodian's service key sign
    /// it and sends it.
    async fn submit_signed(
        &self,
        submission: &ProofSubmission,
        custodian: &dyn KeyCustodian,
    ) -> Result<String> {
        let payer = custodian.public_key();
        let unsigned = self.build_proof_tx(submission, &payer).await?;
        let signature = custodian.sign_attestation(&unsigned.message).await?;
        let signed = self.assemble(&unsigned, &signature)?;
        self.send_transaction(&signed.raw).await
    }
}

/// Bounds a chain call; elapsing is reported as [`MixerError::ChainTimeout`],
/// which callers treat as an unknown outcome.
pub async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(MixerError::ChainTimeout(format!("{} after {:?}", what, limit))),
    }
}

pub fn anchor_discriminator(name: &str) -> [u8; 8] {
    let preimage = format!("global:{}", name);
    let hash = Sha256::digest(preimage.as_bytes());
    let mut discriminator = [0u8; 8];
    discriminator.copy_from_slice(&hash[..8]);
    discriminator
}

fn parse_pubkey(s: &str, what: &str) -> Result<Pubkey> {
    Pubkey::from_str(s).map_err(|e| MixerError::Chain(format!("invalid {} {}: {}", what, s, e)))
}

fn request_key(request_id: &str) -> [u8; 32] {
    Sha256::digest(request_id.as_bytes()).into()
}

/// Solana JSON-RPC client. Pool transfers go through the custody program,
/// which checks the signer against the vault's 1-of-2 policy.
pub struct SolanaChainClient {
    rpc_client: Arc<RpcClient>,
    custody_program_id: Pubkey,
    dispute_program_id: Pubkey,
}

impl SolanaChainClient {
    pub fn new(rpc_client: Arc<RpcClient>, custody_program_id: Pubkey, dispute_program_id: Pubkey) -> Self {
        Self {
            rpc_client,
            custody_program_id,
            dispute_program_id,
        }
    }

    fn transfer_instruction(&self, transfer: &TransferRequest) -> Result<Instruction> {
        let vault = parse_pubkey(&transfer.vault, "vault")?;
        let authority = parse_pubkey(&transfer.authority, "authority")?;
        let destination = parse_pubkey(&transfer.destination, "destination")?;
        let mint = parse_pubkey(&transfer.token, "token")?;

        // pool_transfer(policy_hash: [u8; 32], amount: u64)
        let mut data = anchor_discriminator("pool_transfer").to_vec();
        data.extend_from_slice(&transfer.policy_script_hash);
        data.extend_from_slice(&transfer.amount.to_le_bytes());

        Ok(Instruction {
            program_id: self.custody_program_id,
            accounts: vec![
                AccountMeta::new(authority, true),   // pool custodian key (signer, fee payer)
                AccountMeta::new(vault, false),      // pool vault (mut)
                AccountMeta::new(destination, false), // destination (mut)
                AccountMeta::new_readonly(mint, false),
                AccountMeta::new_readonly(SYSTEM_PROGRAM_ID, false),
            ],
            data,
        })
    }

    fn proof_instruction(&self, submission: &ProofSubmission, payer: Pubkey) -> Instruction {
        let (name, request_id, mut body) = match submission {
            ProofSubmission::Mix {
                request_id,
                commitment,
                signature,
            } => {
                let mut body = commitment.to_vec();
                body.extend_from_slice(&(signature.len() as u32).to_le_bytes());
                body.extend_from_slice(signature);
                ("submit_mix_proof", request_id, body)
            }
            ProofSubmission::Completion {
                request_id,
                merkle_root,
                signature,
                timestamp,
                output_count,
            } => {
                let mut body = merkle_root.to_vec();
                body.extend_from_slice(&(signature.len() as u32).to_le_bytes());
                body.extend_from_slice(signature);
                body.extend_from_slice(&timestamp.to_le_bytes());
                body.extend_from_slice(&output_count.to_le_bytes());
                ("submit_completion_proof", request_id, body)
            }
        };

        let key = request_key(request_id);
        let (dispute_pda, _) =
            Pubkey::find_program_address(&[b"dispute", &key], &self.dispute_program_id);

        let mut data = anchor_discriminator(name).to_vec();
        data.extend_from_slice(&key);
        data.append(&mut body);

        Instruction {
            program_id: self.dispute_program_id,
            accounts: vec![
                AccountMeta::new(payer, true),       // service key (signer, mut)
                AccountMeta::new(dispute_pda, false), // dispute record (mut)
                AccountMeta::new_readonly(SYSTEM_PROGRAM_ID, false),
            ],
            data,
        }
    }

    async fn unsigned(&self, instruction: Instruction, payer: Pubkey) -> Result<UnsignedTx> {
        let blockhash: Hash = self.rpc_client.get_latest_blockhash().await?;
        let message = Message::new_with_blockhash(&[instruction], Some(&payer), &blockhash);
        Ok(UnsignedTx {
            message: message.serialize(),
            signer: payer.to_string(),
        })
    }
}

#[async_trait]
impl ChainClient for SolanaChainClient {
    async fn get_balance(&self, address: &str) -> Result<u64> {
        let pubkey = parse_pubkey(address, "address")?;
        Ok(self.rpc_client.get_balance(&pubkey).await?)
    }

    async fn build_transfer_tx(&self, transfer: &TransferRequest) -> Result<UnsignedTx> {
        let instruction = self.transfer_instruction(transfer)?;
        let authority = parse_pubkey(&transfer.authority, "authority")?;
        self.unsigned(instruction, authority).await
    }

    async fn build_proof_tx(&self, submission: &ProofSubmission, payer: &str) -> Result<UnsignedTx> {
        let payer = parse_pubkey(payer, "payer")?;
        let instruction = self.proof_instruction(submission, payer);
        self.unsigned(instruction, payer).await
    }

    fn assemble(&self, unsigned: &UnsignedTx, signature: &[u8]) -> Result<SignedTx> {
        let message: Message = bincode::deserialize(&unsigned.message)
            .map_err(|e| MixerError::Chain(format!("bad message bytes: {}", e)))?;
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| MixerError::Crypto(format!("signature must be 64 bytes, got {}", signature.len())))?;
        let signature = Signature::from(sig_bytes);

        let signer = parse_pubkey(&unsigned.signer, "signer")?;
        if !signature.verify(signer.as_ref(), &unsigned.message) {
            return Err(MixerError::Crypto(format!("signature does not verify for {}", signer)));
        }

        let transaction = Transaction {
            signatures: vec![signature],
            message,
        };
        let raw = bincode::serialize(&transaction)
            .map_err(|e| MixerError::Chain(format!("serialize transaction: {}", e)))?;

        Ok(SignedTx {
            raw,
            tx_ref: signature.to_string(),
        })
    }

    async fn send_transaction(&self, raw: &[u8]) -> Result<String> {
        let transaction: Transaction = bincode::deserialize(raw)
            .map_err(|e| MixerError::Chain(format!("bad transaction bytes: {}", e)))?;
        let signature = self
            .rpc_client
            .send_transaction(&transaction)
            .await
            .map_err(|e| MixerError::Chain(e.to_string()))?;
        info!("Submitted transaction {}", signature);
        Ok(signature.to_string())
    }

    async fn get_transaction_status(&self, tx_ref: &str) -> Result<ChainTxStatus> {
        let signature = Signature::from_str(tx_ref)
            .map_err(|e| MixerError::Chain(format!("invalid tx ref {}: {}", tx_ref, e)))?;
        let statuses = self.rpc_client.get_signature_statuses(&[signature]).await?;

        let status = match statuses.value.into_iter().next().flatten() {
            None => ChainTxStatus::NotFound,
            Some(s) => match s.err {
                Some(err) => ChainTxStatus::Failed(err.to_string()),
                None => {
                    let confirmations = match (s.confirmations, s.confirmation_status) {
                        (_, Some(TransactionConfirmationStatus::Finalized)) | (None, _) => u64::MAX,
                        (Some(n), _) => n as u64,
                    };
                    ChainTxStatus::Landed {
                        block_height: s.slot,
                        confirmations,
                    }
                }
            },
        };
        debug!("Status of {}: {:?}", tx_ref, status);
        Ok(status)
    }
}
