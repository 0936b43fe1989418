//! Crash point generation with a VRF commit/reveal scheme
//!
//! When a round opens, the server evaluates its schnorrkel VRF on
//! `crash:{round_id}`. The VRF output is unique for a given key and input,
//! so the server cannot grind for a favourable crash point by re-signing.
//! The crash point is derived from the output and only `SHA-256(output)` is
//! published. At crash time the output, pre-output, proof and public key are
//! revealed so anyone can check that the crash point was fixed before the
//! first bet.

use crate::{
    errors::{CrashResult, FairnessError},
    records,
    store::StateStore,
    types::RoundId,
};
use schnorrkel::{
    context::SigningContext,
    vrf::{VRFInOut, VRFPreOut, VRFProof},
    Keypair, PublicKey, SecretKey,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const VRF_SIGNING_CONTEXT: &[u8] = b"crashline";

/// Label for expanding a VRF in/out pair into output bytes
const VRF_OUTPUT_LABEL: &[u8] = b"crash-point";

/// Largest uniform sample used, keeps `1 / (1 - u)` finite
const MAX_UNIFORM: f64 = 1.0 - 1e-12;

/// Map a uniform sample `u ∈ [0, 1)` to a crash point.
///
/// `P(crash >= x) = (1 - h) / x` for `x >= 1`, so any fixed cash-out target
/// returns `1 - h` on average.
pub fn crash_point_from_uniform(u: f64, house_edge: f64, max_multiplier: f64) -> f64 {
    let u = if u.is_nan() { 0.0 } else { u.clamp(0.0, MAX_UNIFORM) };
    let raw = (1.0 - house_edge) / (1.0 - u);
    raw.max(1.0).min(max_multiplier.max(1.0))
}

/// Uniform sample in `[0, 1)` from the top 53 bits of a digest
pub fn uniform_from_digest(bytes: &[u8]) -> f64 {
    let mut head = [0u8; 8];
    let n = bytes.len().min(8);
    head[..n].copy_from_slice(&bytes[..n]);
    (u64::from_be_bytes(head) >> 11) as f64 / (1u64 << 53) as f64
}

/// Public commitment to a round output
pub fn commitment_for(output: &[u8]) -> String {
    hex::encode(Sha256::digest(output))
}

/// Everything needed to re-derive and verify a crash point after the round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FairnessProof {
    /// Hex-encoded VRF output (32 bytes)
    pub vrf_output: String,
    /// Hex-encoded VRF pre-output the output is expanded from (32 bytes)
    pub vrf_preout: String,
    /// Hex-encoded DLEQ proof binding the pre-output to the key (64 bytes)
    pub vrf_proof: String,
    /// Hex-encoded server public key (32 bytes)
    pub public_key: String,
    pub input_message: String,
}

/// A crash point fixed at round creation together with its commitment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashSeal {
    pub crash_point: f64,
    pub commitment: String,
    /// Absent for scripted crash points
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<FairnessProof>,
}

/// VRF-based crash point generator
#[derive(Clone)]
pub struct FairnessEngine {
    keypair: Arc<Keypair>,
}

impl FairnessEngine {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair: Arc::new(keypair),
        }
    }

    /// Fresh random key, nothing persisted
    pub fn new_random() -> Self {
        use rand_core::OsRng;
        Self::new(Keypair::generate_with(OsRng))
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, FairnessError> {
        let bytes = hex::decode(secret_hex)
            .map_err(|e| FairnessError::InvalidKey(format!("invalid hex: {}", e)))?;
        let secret = SecretKey::from_bytes(&bytes)
            .map_err(|e| FairnessError::InvalidKey(format!("{:?}", e)))?;
        Ok(Self::new(secret.to_keypair()))
    }

    /// Load the signing key from the store, creating it on first start.
    ///
    /// Keeps the published public key stable across restarts.
    pub async fn load_or_create(store: &dyn StateStore) -> CrashResult<Self> {
        if let Some(value) = store.get(records::FAIRNESS_KEY).await? {
            let secret_hex = value.as_str().ok_or_else(|| {
                FairnessError::InvalidKey(format!("{} is not a string", records::FAIRNESS_KEY))
            })?;
            return Ok(Self::from_secret_hex(secret_hex)?);
        }

        let engine = Self::new_random();
        store
            .set(records::FAIRNESS_KEY, serde_json::Value::String(engine.secret_hex()))
            .await?;
        tracing::info!(public_key = %engine.public_key_hex(), "Created new fairness signing key");
        Ok(engine)
    }

    fn secret_hex(&self) -> String {
        hex::encode(self.keypair.secret.to_bytes())
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keypair.public.to_bytes())
    }

    /// Fix the crash point for a round and produce its commitment
    pub fn seal(&self, round_id: &RoundId, house_edge: f64, max_multiplier: f64) -> CrashSeal {
        let input_message = format!("crash:{}", round_id);

        let ctx = SigningContext::new(VRF_SIGNING_CONTEXT);
        let (inout, proof, _) = self.keypair.vrf_sign(ctx.bytes(input_message.as_bytes()));
        let output = vrf_output_bytes(&inout);

        let crash_point =
            crash_point_from_uniform(uniform_from_digest(&output), house_edge, max_multiplier);

        CrashSeal {
            crash_point,
            commitment: commitment_for(&output),
            proof: Some(FairnessProof {
                vrf_output: hex::encode(output),
                vrf_preout: hex::encode(inout.to_preout().to_bytes()),
                vrf_proof: hex::encode(proof.to_bytes()),
                public_key: self.public_key_hex(),
                input_message,
            }),
        }
    }

    /// Check a revealed proof against the commitment published at round
    /// open and return the crash point it implies.
    pub fn verify_reveal(
        commitment: &str,
        proof: &FairnessProof,
        house_edge: f64,
        max_multiplier: f64,
    ) -> Result<f64, FairnessError> {
        let output = decode_hex("vrf_output", &proof.vrf_output)?;
        let preout_bytes = decode_hex("vrf_preout", &proof.vrf_preout)?;
        let proof_bytes = decode_hex("vrf_proof", &proof.vrf_proof)?;
        let public_key_bytes = decode_hex("public_key", &proof.public_key)?;

        let public_key = PublicKey::from_bytes(&public_key_bytes)
            .map_err(|e| FairnessError::MalformedProof(format!("public key: {:?}", e)))?;
        let preout = VRFPreOut::from_bytes(&preout_bytes)
            .map_err(|e| FairnessError::MalformedProof(format!("pre-output: {:?}", e)))?;
        let dleq = VRFProof::from_bytes(&proof_bytes)
            .map_err(|e| FairnessError::MalformedProof(format!("proof: {:?}", e)))?;

        let ctx = SigningContext::new(VRF_SIGNING_CONTEXT);
        let (inout, _) = public_key
            .vrf_verify(ctx.bytes(proof.input_message.as_bytes()), &preout, &dleq)
            .map_err(|_| FairnessError::BadSignature)?;

        if vrf_output_bytes(&inout).as_slice() != output.as_slice() {
            return Err(FairnessError::MalformedProof(
                "output does not match the VRF pre-output".to_string(),
            ));
        }
        if commitment_for(&output) != commitment {
            return Err(FairnessError::CommitmentMismatch);
        }

        Ok(crash_point_from_uniform(
            uniform_from_digest(&output),
            house_edge,
            max_multiplier,
        ))
    }
}

fn vrf_output_bytes(inout: &VRFInOut) -> [u8; 32] {
    inout.make_bytes::<[u8; 32]>(VRF_OUTPUT_LABEL)
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>, FairnessError> {
    hex::decode(value).map_err(|e| FairnessError::MalformedProof(format!("{}: {}", field, e)))
}

/// Source of sealed crash points, one per round
pub trait CrashPointSource: Send + Sync {
    fn seal(&self, round_id: &RoundId) -> CrashResult<CrashSeal>;
}

/// Production source: VRF-derived crash points
pub struct VrfCrashPoints {
    engine: FairnessEngine,
    house_edge: f64,
    max_multiplier: f64,
}

impl VrfCrashPoints {
    pub fn new(engine: FairnessEngine, house_edge: f64, max_multiplier: f64) -> Self {
        Self {
            engine,
            house_edge,
            max_multiplier,
        }
    }

    pub fn engine(&self) -> &FairnessEngine {
        &self.engine
    }
}

impl CrashPointSource for VrfCrashPoints {
    fn seal(&self, round_id: &RoundId) -> CrashResult<CrashSeal> {
        Ok(self.engine.seal(round_id, self.house_edge, self.max_multiplier))
    }
}

/// Predetermined crash points for simulations and replays
pub struct ScriptedCrashPoints {
    queue: Mutex<VecDeque<f64>>,
    repeat: bool,
}

impl ScriptedCrashPoints {
    /// Each crash point is used once, then the source is exhausted
    pub fn once(points: impl IntoIterator<Item = f64>) -> Self {
        Self {
            queue: Mutex::new(points.into_iter().collect()),
            repeat: false,
        }
    }

    /// Cycle through the crash points forever
    pub fn repeating(points: impl IntoIterator<Item = f64>) -> Self {
        Self {
            queue: Mutex::new(points.into_iter().collect()),
            repeat: true,
        }
    }
}

impl CrashPointSource for ScriptedCrashPoints {
    fn seal(&self, round_id: &RoundId) -> CrashResult<CrashSeal> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| FairnessError::Exhausted("scripted queue poisoned".to_string()))?;
        let next = queue
            .pop_front()
            .ok_or_else(|| FairnessError::Exhausted("no scripted crash points left".to_string()))?;
        if self.repeat {
            queue.push_back(next);
        }

        let crash_point = next.max(1.0);
        let preimage = format!("scripted:{}:{}", round_id, crash_point);
        Ok(CrashSeal {
            crash_point,
            commitment: commitment_for(preimage.as_bytes()),
            proof: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn test_crash_point_bounds() {
        assert_eq!(crash_point_from_uniform(0.0, 0.01, 1e6), 1.0);
        assert!((crash_point_from_uniform(0.5, 0.01, 1e6) - 1.98).abs() < 1e-12);
        assert_eq!(crash_point_from_uniform(1.0, 0.01, 1e6), 1e6);
        assert_eq!(crash_point_from_uniform(f64::NAN, 0.01, 1e6), 1.0);
        assert!(crash_point_from_uniform(0.999_999_999_999_9, 0.01, f64::INFINITY).is_finite());
    }

    #[test]
    fn test_uniform_from_digest_range() {
        assert_eq!(uniform_from_digest(&[0u8; 32]), 0.0);
        let top = uniform_from_digest(&[0xff; 32]);
        assert!(top < 1.0 && top > 0.999_999);
    }

    #[test]
    fn test_fixed_target_returns_one_minus_house_edge() {
        let house_edge = 0.01;
        let mut rng = StdRng::seed_from_u64(7);
        let samples = 200_000;

        let mut survived_2x = 0usize;
        for _ in 0..samples {
            let c = crash_point_from_uniform(rng.gen::<f64>(), house_edge, 1e6);
            assert!(c >= 1.0);
            if c >= 2.0 {
                survived_2x += 1;
            }
        }

        // Expected return of always cashing out at 2x is 2 * P(c >= 2) = 1 - h
        let expected_return = 2.0 * survived_2x as f64 / samples as f64;
        assert!((expected_return - (1.0 - house_edge)).abs() < 0.01, "{}", expected_return);
    }

    #[test]
    fn test_seal_and_verify_round_trip() {
        let engine = FairnessEngine::new_random();
        let round_id = RoundId::from("round-1");
        let seal = engine.seal(&round_id, 0.01, 1e6);

        assert!(seal.crash_point >= 1.0);
        let proof = seal.proof.as_ref().expect("vrf proof");
        let verified = FairnessEngine::verify_reveal(&seal.commitment, proof, 0.01, 1e6)
            .expect("valid reveal");
        assert_eq!(verified, seal.crash_point);
    }

    #[test]
    fn test_seal_is_unique_per_round() {
        let engine = FairnessEngine::new_random();
        let round_id = RoundId::from("round-3");

        let first = engine.seal(&round_id, 0.01, 1e6);
        let second = engine.seal(&round_id, 0.01, 1e6);
        // Proofs carry fresh randomness, the output may not
        assert_eq!(first.crash_point, second.crash_point);
        assert_eq!(first.commitment, second.commitment);
        let (a, b) = (first.proof.unwrap(), second.proof.unwrap());
        assert_eq!(a.vrf_output, b.vrf_output);
        assert_eq!(a.vrf_preout, b.vrf_preout);
        assert!(FairnessEngine::verify_reveal(&second.commitment, &b, 0.01, 1e6).is_ok());

        let other = engine.seal(&RoundId::from("round-4"), 0.01, 1e6);
        assert_ne!(other.commitment, first.commitment);
    }

    #[test]
    fn test_tampered_reveal_is_rejected() {
        let engine = FairnessEngine::new_random();
        let seal = engine.seal(&RoundId::from("round-2"), 0.01, 1e6);
        let mut proof = seal.proof.clone().unwrap();

        proof.vrf_output = hex::encode([0xffu8; 32]);
        assert!(FairnessEngine::verify_reveal(&seal.commitment, &proof, 0.01, 1e6).is_err());

        let mut proof = seal.proof.clone().unwrap();
        let foreign = FairnessEngine::new_random().seal(&RoundId::from("round-2"), 0.01, 1e6);
        proof.vrf_preout = foreign.proof.unwrap().vrf_preout;
        assert!(matches!(
            FairnessEngine::verify_reveal(&seal.commitment, &proof, 0.01, 1e6),
            Err(FairnessError::BadSignature)
        ));

        let proof = seal.proof.clone().unwrap();
        let other = commitment_for(b"something else");
        assert!(matches!(
            FairnessEngine::verify_reveal(&other, &proof, 0.01, 1e6),
            Err(FairnessError::CommitmentMismatch)
        ));

        let mut proof = seal.proof.unwrap();
        proof.input_message = "crash:another-round".to_string();
        assert!(matches!(
            FairnessEngine::verify_reveal(&seal.commitment, &proof, 0.01, 1e6),
            Err(FairnessError::BadSignature)
        ));
    }

    #[test]
    fn test_secret_round_trip() {
        let engine = FairnessEngine::new_random();
        let restored = FairnessEngine::from_secret_hex(&engine.secret_hex()).unwrap();
        assert_eq!(engine.public_key_hex(), restored.public_key_hex());
    }

    #[test]
    fn test_scripted_points() {
        let once = ScriptedCrashPoints::once([2.0, 0.5]);
        let id = RoundId::from("r");
        assert_eq!(once.seal(&id).unwrap().crash_point, 2.0);
        assert_eq!(once.seal(&id).unwrap().crash_point, 1.0);
        assert!(once.seal(&id).is_err());

        let repeating = ScriptedCrashPoints::repeating([3.0]);
        for _ in 0..3 {
            assert_eq!(repeating.seal(&id).unwrap().crash_point, 3.0);
        }
    }
}
