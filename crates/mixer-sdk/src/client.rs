/// Talks to the mixer service: create → deposit → (proof | claim | dispute)
use mixer_network::{Config as NetConfig, HttpClient};
use tracing::warn;

use crate::api::{
    ClaimRequest, ClaimResponse, CompletionProofResponse, ConfirmDepositRequest, CreateMixRequest,
    DisputeResponse, InfoResponse, ListRequestsResponse, MixRequestView, StatsResponse,
    TargetSpec,
};
use crate::crypto::seal_targets;
use crate::error::{Result, SdkError};
use crate::merkle::{decode_node, MerkleProof};

pub struct ClientConfig {
    /// Mixer base URL, e.g. `http://mixer.onion`
    pub base_url: String,
    /// Caller identity sent as `x-account-id`
    pub account_id: String,
    /// SOCKS5 proxy address; `None` connects directly
    pub tor_socks_addr: Option<String>,
    /// Refuse to send requests until the proxy is confirmed to be Tor
    pub require_tor: bool,
}

pub struct MixerClient {
    config: ClientConfig,
    http: HttpClient,
    tor_verified: bool,
}

impl MixerClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let mut net = NetConfig::default().with_header("x-account-id", &config.account_id);
        if let Some(addr) = &config.tor_socks_addr {
            net = net.with_socks_addr(addr);
        }
        let http = HttpClient::new(net)?;

        Ok(Self {
            config,
            http,
            tor_verified: false,
        })
    }

    async fn ensure_tor(&mut self) -> Result<()> {
        if !self.config.require_tor || self.tor_verified {
            return Ok(());
        }

        let is_tor = self.http.verify_tor_connection().await?;
        if !is_tor {
            return Err(SdkError::TorRequired(
                "Tor connection required but not detected. Refusing to send sensitive data.".into(),
            ));
        }

        self.tor_verified = true;
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    pub async fn info(&self) -> Result<InfoResponse> {
        Ok(self.http.get_json(&self.url("/info")).await?)
    }

    pub async fn create_request(&mut self, request: &CreateMixRequest) -> Result<MixRequestView> {
        self.ensure_tor().await?;
        Ok(self.http.post_json(&self.url("/request"), request).await?)
    }

    /// Same as [`create_request`](Self::create_request) but seals the targets
    /// to the service's encryption key first.
    pub async fn create_sealed_request(
        &mut self,
        mut request: CreateMixRequest,
        targets: &[TargetSpec],
    ) -> Result<MixRequestView> {
        let info = self.info().await?;
        let key: [u8; 32] = hex::decode(&info.encryption_pubkey)
            .map_err(|_| SdkError::Crypto("Invalid service encryption key".into()))?
            .try_into()
            .map_err(|_| SdkError::Crypto("Service encryption key must be 32 bytes".into()))?;

        request.targets.clear();
        request.encrypted_targets = Some(seal_targets(targets, &key)?);
        self.create_request(&request).await
    }

    pub async fn get_request(&self, id: &str) -> Result<MixRequestView> {
        Ok(self.http.get_json(&self.url(&format!("/request/{}", id))).await?)
    }

    pub async fn list_requests(&self, offset: usize, limit: usize) -> Result<ListRequestsResponse> {
        let url = self.url(&format!("/requests?offset={}&limit={}", offset, limit));
        Ok(self.http.get_json(&url).await?)
    }

    pub async fn confirm_deposit(&mut self, id: &str, tx_refs: Vec<String>) -> Result<MixRequestView> {
        self.ensure_tor().await?;
        let url = self.url(&format!("/request/{}/deposit", id));
        Ok(self.http.post_json(&url, &ConfirmDepositRequest { tx_refs }).await?)
    }

    pub async fn resume(&mut self, id: &str) -> Result<MixRequestView> {
        self.ensure_tor().await?;
        let url = self.url(&format!("/request/{}/resume", id));
        Ok(self.http.post_json(&url, &serde_json::json!({})).await?)
    }

    pub async fn dispute(&mut self, id: &str) -> Result<DisputeResponse> {
        self.ensure_tor().await?;
        let url = self.url(&format!("/request/{}/dispute", id));
        Ok(self.http.post_json(&url, &serde_json::json!({})).await?)
    }

    pub async fn claim(&mut self, id: &str, claim_address: &str) -> Result<ClaimResponse> {
        self.ensure_tor().await?;
        let url = self.url(&format!("/request/{}/claim", id));
        let body = ClaimRequest {
            claim_address: claim_address.to_string(),
        };
        Ok(self.http.post_json(&url, &body).await?)
    }

    /// Fetches the completion proof and checks every output against its root.
    pub async fn get_proof(&self, id: &str) -> Result<CompletionProofResponse> {
        let proof: CompletionProofResponse =
            self.http.get_json(&self.url(&format!("/request/{}/proof", id))).await?;
        if let Err(e) = verify_completion_proof(&proof) {
            warn!("Completion proof for {} failed verification: {}", id, e);
            return Err(e);
        }
        Ok(proof)
    }

    pub async fn stats(&self) -> Result<StatsResponse> {
        Ok(self.http.get_json(&self.url("/stats")).await?)
    }

    pub fn is_tor_verified(&self) -> bool {
        self.tor_verified
    }
}

/// Recomputes each output's leaf and checks its path to the Merkle root.
pub fn verify_completion_proof(proof: &CompletionProofResponse) -> Result<()> {
    let root = decode_node(&proof.merkle_root)?;
    if proof.outputs.len() != proof.output_count {
        return Err(SdkError::InvalidProof(format!(
            "expected {} outputs, got {}",
            proof.output_count,
            proof.outputs.len()
        )));
    }

    for output in &proof.outputs {
        let expected = crate::merkle::leaf_hash(&output.address, output.amount, &output.nonce, &proof.request_id);
        let path = MerkleProof::from_hex(&output.leaf, &output.siblings, &output.sibling_is_right)?;
        if path.leaf != expected {
            return Err(SdkError::InvalidProof(format!("output {} leaf mismatch", output.index)));
        }
        if !path.verify(&root) {
            return Err(SdkError::InvalidProof(format!("output {} not under root", output.index)));
        }
    }
    Ok(())
}
