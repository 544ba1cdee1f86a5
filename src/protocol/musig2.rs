//! MuSig2 signing sessions for cooperative key path spends.
//!
//! Keys are aggregated in the fixed order `[counterparty, ours]` and tweaked with the tree's taproot
//! tweak. A [`SigningSession`] owns exactly one secret nonce: it can produce one partial signature,
//! either for a transaction the counterparty builds ([`SigningSession::sign`]) or for one we build
//! ([`SigningSession::finalize`]).

use bitcoin::{
    hashes::Hash,
    secp256k1::rand::{thread_rng, RngCore},
    sighash::{Prevouts, SighashCache},
    taproot::{self, TaprootSpendInfo},
    Transaction, TxOut, Witness,
};
use secp256k1::{
    musig::{
        new_nonce_pair, AggregatedNonce, KeyAggCache, PartialSignature, PublicNonce, SecretNonce,
        Session, SessionSecretRand,
    },
    Keypair, Message, PublicKey, Scalar, Secp256k1, SecretKey, XOnlyPublicKey,
};

use super::{error::ProtocolError, swap_tree::CooperativeTree};
use crate::api::PartialSignatureResponse;

/// Signature hash type used for every swap spend.
pub const SIGHASH_TYPE: bitcoin::TapSighashType = bitcoin::TapSighashType::Default;

fn to_musig_pubkey(key: &bitcoin::secp256k1::PublicKey) -> Result<PublicKey, ProtocolError> {
    Ok(PublicKey::from_slice(&key.serialize())?)
}

fn to_musig_seckey(key: &bitcoin::secp256k1::SecretKey) -> Result<SecretKey, ProtocolError> {
    Ok(SecretKey::from_slice(&key.secret_bytes())?)
}

/// Aggregates `[counterparty, ours]` without sorting and returns the untweaked internal key.
pub fn aggregate_internal_key(
    counterparty: &bitcoin::secp256k1::PublicKey,
    ours: &bitcoin::secp256k1::PublicKey,
) -> Result<bitcoin::secp256k1::XOnlyPublicKey, ProtocolError> {
    let secp = Secp256k1::new();
    let signers = [to_musig_pubkey(counterparty)?, to_musig_pubkey(ours)?];
    let cache = KeyAggCache::new(&secp, &[&signers[0], &signers[1]]);
    Ok(bitcoin::secp256k1::XOnlyPublicKey::from_slice(
        &cache.agg_pk().serialize(),
    )?)
}

/// Taproot key path sighash of input `index`.
pub fn key_spend_sighash(
    tx: &Transaction,
    prevouts: &[TxOut],
    index: usize,
) -> Result<[u8; 32], ProtocolError> {
    let mut sighasher = SighashCache::new(tx);
    let sighash = sighasher.taproot_key_spend_signature_hash(
        index,
        &Prevouts::All(prevouts),
        SIGHASH_TYPE,
    )?;
    Ok(sighash.to_byte_array())
}

/// One MuSig2 nonce and partial signature exchange.
pub struct SigningSession {
    secp: Secp256k1<secp256k1::All>,
    cache: KeyAggCache,
    keypair: Keypair,
    counterparty: PublicKey,
    output_key: XOnlyPublicKey,
    sec_nonce: Option<SecretNonce>,
    pub_nonce: PublicNonce,
}

impl SigningSession {
    /// Opens a session for the key path of `tree`.
    pub fn new(tree: &impl CooperativeTree) -> Result<Self, ProtocolError> {
        let secp = Secp256k1::new();
        let our_key = to_musig_seckey(tree.our_key())?;
        let counterparty = to_musig_pubkey(tree.counterparty_key())?;
        let ours = our_key.public_key(&secp);
        Self::from_parts(our_key, [counterparty, ours], counterparty, tree.spend_info())
    }

    /// Opens a session with an explicit signer order.
    pub(crate) fn from_parts(
        our_key: SecretKey,
        signers: [PublicKey; 2],
        counterparty: PublicKey,
        spend_info: &TaprootSpendInfo,
    ) -> Result<Self, ProtocolError> {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &our_key);

        let mut cache = KeyAggCache::new(&secp, &[&signers[0], &signers[1]]);
        let tweak = Scalar::from_be_bytes(spend_info.tap_tweak().to_scalar().to_be_bytes())?;
        cache.pubkey_xonly_tweak_add(&secp, &tweak)?;

        let output_key = cache.agg_pk();
        if output_key.serialize() != spend_info.output_key().to_inner().serialize() {
            return Err(ProtocolError::General(
                "aggregated key does not match the tree output key",
            ));
        }

        let mut session_rand = [0u8; 32];
        thread_rng().fill_bytes(&mut session_rand);
        let (sec_nonce, pub_nonce) = new_nonce_pair(
            &secp,
            SessionSecretRand::assume_unique_per_nonce_gen(session_rand),
            Some(&cache),
            Some(our_key),
            keypair.public_key(),
            None,
            None,
        );

        Ok(Self {
            secp,
            cache,
            keypair,
            counterparty,
            output_key,
            sec_nonce: Some(sec_nonce),
            pub_nonce,
        })
    }

    /// Our 66 byte public nonce.
    pub fn public_nonce(&self) -> [u8; 66] {
        self.pub_nonce.serialize()
    }

    fn session(&self, hash: &[u8], counterparty_nonce: &[u8]) -> Result<Session, ProtocolError> {
        let hash: [u8; 32] = hash
            .try_into()
            .map_err(|_| ProtocolError::InvalidHashLength(hash.len()))?;
        let nonce: &[u8; 66] = counterparty_nonce
            .try_into()
            .map_err(|_| ProtocolError::InvalidNonceLength(counterparty_nonce.len()))?;
        let counterparty_nonce = PublicNonce::from_byte_array(nonce)?;

        let agg_nonce = AggregatedNonce::new(&self.secp, &[&counterparty_nonce, &self.pub_nonce]);
        Ok(Session::new(
            &self.secp,
            &self.cache,
            agg_nonce,
            Message::from_digest(hash),
        ))
    }

    fn partial_sign(&mut self, session: &Session) -> Result<PartialSignature, ProtocolError> {
        let sec_nonce = self
            .sec_nonce
            .take()
            .ok_or(ProtocolError::General("signing session already used"))?;
        Ok(session.partial_sign(&self.secp, sec_nonce, &self.keypair, &self.cache))
    }

    /// Signs the 32 byte `hash` after registering the counterparty's 66 byte nonce.
    pub fn sign(
        &mut self,
        hash: &[u8],
        counterparty_nonce: &[u8],
    ) -> Result<PartialSignatureResponse, ProtocolError> {
        let session = self.session(hash, counterparty_nonce)?;
        let partial = self.partial_sign(&session)?;
        Ok(PartialSignatureResponse {
            pub_nonce: self.public_nonce().to_vec(),
            partial_signature: partial.serialize().to_vec(),
        })
    }

    /// Combines our partial signature with the counterparty's and writes the key path witness of
    /// input `index`.
    pub fn finalize(
        mut self,
        tx: &mut Transaction,
        prevouts: &[TxOut],
        index: usize,
        counterparty: &PartialSignatureResponse,
    ) -> Result<(), ProtocolError> {
        let hash = key_spend_sighash(tx, prevouts, index)?;
        let session = self.session(&hash, &counterparty.pub_nonce)?;

        let their_partial: &[u8; 32] = counterparty
            .partial_signature
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::InvalidPartialSignature)?;
        let their_partial = PartialSignature::from_byte_array(their_partial)?;
        let their_nonce: &[u8; 66] = counterparty
            .pub_nonce
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::InvalidNonceLength(counterparty.pub_nonce.len()))?;
        let their_nonce = PublicNonce::from_byte_array(their_nonce)?;

        if !session.partial_verify(
            &self.secp,
            &self.cache,
            &their_partial,
            &their_nonce,
            self.counterparty,
        ) {
            return Err(ProtocolError::InvalidPartialSignature);
        }

        let our_partial = self.partial_sign(&session)?;
        let aggregated = session.partial_sig_agg(&[&their_partial, &our_partial]);
        let signature = aggregated
            .verify(&self.secp, &self.output_key, &hash)
            .map_err(|_| ProtocolError::InvalidAggregatedSignature)?;

        let signature = taproot::Signature {
            signature: bitcoin::secp256k1::schnorr::Signature::from_slice(
                &signature.serialize(),
            )?,
            sighash_type: SIGHASH_TYPE,
        };
        let input = tx
            .input
            .get_mut(index)
            .ok_or(ProtocolError::MissingOutput(index as u32))?;
        input.witness = Witness::p2tr_key_spend(&signature);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::swap_tree::{OurSide, SwapTree, TreeKind};
    use bitcoin::{
        absolute::LockTime, hashes::sha256, transaction::Version, Amount, Network, OutPoint,
        ScriptBuf, Sequence, TxIn, Txid,
    };

    /// The counterparty's half of a session over `tree`, keyed with `their_key`.
    pub(crate) fn counterparty_session(
        tree: &impl CooperativeTree,
        their_key: &bitcoin::secp256k1::SecretKey,
    ) -> SigningSession {
        let secp = Secp256k1::new();
        let their_key = to_musig_seckey(their_key).unwrap();
        let ours = to_musig_pubkey(&tree.our_key().public_key(&bitcoin::secp256k1::Secp256k1::new()))
            .unwrap();
        let theirs = their_key.public_key(&secp);
        SigningSession::from_parts(their_key, [theirs, ours], ours, tree.spend_info()).unwrap()
    }

    fn spending_tx(tree: &SwapTree) -> (Transaction, Vec<TxOut>) {
        let prevout = TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: tree.address(Network::Regtest).script_pubkey(),
        };
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::all_zeros(), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ZERO,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(49_000),
                script_pubkey: ScriptBuf::new(),
            }],
        };
        (tx, vec![prevout])
    }

    fn tree() -> (SwapTree, bitcoin::secp256k1::SecretKey) {
        let mut rng = thread_rng();
        let ours = bitcoin::secp256k1::SecretKey::new(&mut rng);
        let theirs = bitcoin::secp256k1::SecretKey::new(&mut rng);
        let secp = bitcoin::secp256k1::Secp256k1::new();
        let tree = SwapTree::new(
            TreeKind::Reverse,
            OurSide::Claim,
            ours,
            theirs.public_key(&secp),
            sha256::Hash::hash(b"preimage"),
            1000,
        )
        .unwrap();
        (tree, theirs)
    }

    #[test]
    fn test_cooperative_key_spend() {
        let (tree, theirs) = tree();
        let (mut tx, prevouts) = spending_tx(&tree);

        let session = SigningSession::new(&tree).unwrap();
        let hash = key_spend_sighash(&tx, &prevouts, 0).unwrap();
        let mut counterparty = counterparty_session(&tree, &theirs);
        let their_partial = counterparty.sign(&hash, &session.public_nonce()).unwrap();

        session.finalize(&mut tx, &prevouts, 0, &their_partial).unwrap();

        let witness = &tx.input[0].witness;
        assert_eq!(witness.len(), 1);
        let signature =
            bitcoin::secp256k1::schnorr::Signature::from_slice(witness.nth(0).unwrap()).unwrap();
        let secp = bitcoin::secp256k1::Secp256k1::new();
        let message = bitcoin::secp256k1::Message::from_digest(hash);
        secp.verify_schnorr(&signature, &message, &tree.spend_info().output_key().to_inner())
            .unwrap();
    }

    #[test]
    fn test_session_is_single_use() {
        let (tree, _) = tree();
        let mut session = SigningSession::new(&tree).unwrap();
        let other = SigningSession::new(&tree).unwrap();
        let nonce = other.public_nonce();

        assert!(session.sign(&[1u8; 32], &nonce).is_ok());
        assert!(matches!(
            session.sign(&[1u8; 32], &nonce),
            Err(ProtocolError::General(_))
        ));
    }

    #[test]
    fn test_rejects_malformed_inputs() {
        let (tree, _) = tree();
        let mut session = SigningSession::new(&tree).unwrap();
        let nonce = SigningSession::new(&tree).unwrap().public_nonce();

        assert!(matches!(
            session.sign(&[1u8; 31], &nonce),
            Err(ProtocolError::InvalidHashLength(31))
        ));
        assert!(matches!(
            session.sign(&[1u8; 32], &nonce[..65]),
            Err(ProtocolError::InvalidNonceLength(65))
        ));
    }

    #[test]
    fn test_finalize_rejects_bad_partial() {
        let (tree, theirs) = tree();
        let (mut tx, prevouts) = spending_tx(&tree);
        let session = SigningSession::new(&tree).unwrap();
        let mut counterparty = counterparty_session(&tree, &theirs);
        // Signed over the wrong message.
        let their_partial = counterparty.sign(&[9u8; 32], &session.public_nonce()).unwrap();

        assert!(matches!(
            session.finalize(&mut tx, &prevouts, 0, &their_partial),
            Err(ProtocolError::InvalidPartialSignature)
        ));
        assert!(tx.input[0].witness.is_empty());
    }
}
