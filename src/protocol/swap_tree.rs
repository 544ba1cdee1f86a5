//! Taproot script trees locking swap and funding outputs.
//!
//! A [`SwapTree`] commits to a claim leaf gated by the payment preimage and a refund leaf gated by
//! a timeout. Its internal key is the MuSig2 aggregate of `[counterparty, ours]`, so either party
//! can spend cooperatively through the key path, or unilaterally through its leaf.

use bitcoin::{
    hashes::{ripemd160, sha256, Hash},
    opcodes::all::{OP_CHECKSIG, OP_CHECKSIGVERIFY, OP_CLTV, OP_EQUALVERIFY, OP_HASH160, OP_SIZE},
    script,
    secp256k1::{PublicKey, Secp256k1, SecretKey, XOnlyPublicKey},
    taproot::{ControlBlock, LeafVersion, TaprootBuilder, TaprootSpendInfo},
    Address, Network, ScriptBuf,
};

use super::{error::ProtocolError, musig2::aggregate_internal_key};

/// Shape of the claim leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    /// Submarine swaps: `HASH160 <h> EQUALVERIFY <claim> CHECKSIG`.
    Submarine,
    /// Reverse and chain swaps additionally require a 32 byte preimage.
    Reverse,
}

/// Which leaf of the tree belongs to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OurSide {
    /// We claim with the preimage. The counterparty refunds.
    Claim,
    /// We refund after the timeout. The counterparty claims.
    Refund,
}

/// A tree whose key path is a 2-of-2 MuSig2 aggregate of `[counterparty, ours]`.
pub trait CooperativeTree {
    /// Our signing key.
    fn our_key(&self) -> &SecretKey;
    /// The counterparty's public key.
    fn counterparty_key(&self) -> &PublicKey;
    /// Finalized taproot spend info.
    fn spend_info(&self) -> &TaprootSpendInfo;

    /// P2TR address of the tree output.
    fn address(&self, network: Network) -> Address {
        Address::p2tr_tweaked(self.spend_info().output_key(), network)
    }

    /// Fails unless the tree derives exactly `expected`.
    fn check_address(&self, expected: &str, network: Network) -> Result<(), ProtocolError> {
        let derived = self.address(network).to_string();
        if derived != expected {
            return Err(ProtocolError::AddressMismatch {
                expected: derived,
                found: expected.to_string(),
            });
        }
        Ok(())
    }
}

/// Taproot tree of a swap output.
#[derive(Debug, Clone)]
pub struct SwapTree {
    kind: TreeKind,
    side: OurSide,
    our_key: SecretKey,
    counterparty_key: PublicKey,
    timeout_block_height: u32,
    claim_leaf: ScriptBuf,
    refund_leaf: ScriptBuf,
    spend_info: TaprootSpendInfo,
}

impl SwapTree {
    /// Builds the tree for `payment_hash` (sha256 of the preimage).
    pub fn new(
        kind: TreeKind,
        side: OurSide,
        our_key: SecretKey,
        counterparty_key: PublicKey,
        payment_hash: sha256::Hash,
        timeout_block_height: u32,
    ) -> Result<Self, ProtocolError> {
        let secp = Secp256k1::new();
        let our_public = our_key.public_key(&secp);
        let (claim_key, refund_key) = match side {
            OurSide::Claim => (our_public, counterparty_key),
            OurSide::Refund => (counterparty_key, our_public),
        };

        let claim_leaf = claim_script(kind, &payment_hash, &claim_key.x_only_public_key().0);
        let refund_leaf = refund_script(&refund_key.x_only_public_key().0, timeout_block_height);

        let internal_key = aggregate_internal_key(&counterparty_key, &our_public)?;
        let spend_info = TaprootBuilder::new()
            .add_leaf(1, claim_leaf.clone())?
            .add_leaf(1, refund_leaf.clone())?
            .finalize(&secp, internal_key)?;

        Ok(Self {
            kind,
            side,
            our_key,
            counterparty_key,
            timeout_block_height,
            claim_leaf,
            refund_leaf,
            spend_info,
        })
    }

    /// Claim leaf script.
    pub fn claim_leaf(&self) -> &ScriptBuf {
        &self.claim_leaf
    }

    /// Refund leaf script.
    pub fn refund_leaf(&self) -> &ScriptBuf {
        &self.refund_leaf
    }

    /// Shape of the claim leaf.
    pub fn kind(&self) -> TreeKind {
        self.kind
    }

    /// Our side of the tree.
    pub fn side(&self) -> OurSide {
        self.side
    }

    /// Refund timeout.
    pub fn timeout_block_height(&self) -> u32 {
        self.timeout_block_height
    }

    /// Untweaked aggregate key.
    pub fn internal_key(&self) -> XOnlyPublicKey {
        self.spend_info.internal_key()
    }

    /// Control block proving `leaf` is part of the tree.
    pub fn control_block(&self, leaf: &ScriptBuf) -> Result<ControlBlock, ProtocolError> {
        control_block(&self.spend_info, leaf)
    }
}

impl CooperativeTree for SwapTree {
    fn our_key(&self) -> &SecretKey {
        &self.our_key
    }

    fn counterparty_key(&self) -> &PublicKey {
        &self.counterparty_key
    }

    fn spend_info(&self) -> &TaprootSpendInfo {
        &self.spend_info
    }
}

/// Single-leaf tree of a funding address. Only we can spend through the leaf, after the timeout.
#[derive(Debug, Clone)]
pub struct FundingTree {
    our_key: SecretKey,
    counterparty_key: PublicKey,
    refund_leaf: ScriptBuf,
    spend_info: TaprootSpendInfo,
}

impl FundingTree {
    /// Builds the funding tree.
    pub fn new(
        our_key: SecretKey,
        counterparty_key: PublicKey,
        timeout_block_height: u32,
    ) -> Result<Self, ProtocolError> {
        let secp = Secp256k1::new();
        let our_public = our_key.public_key(&secp);
        let refund_leaf = refund_script(&our_public.x_only_public_key().0, timeout_block_height);

        let internal_key = aggregate_internal_key(&counterparty_key, &our_public)?;
        let spend_info = TaprootBuilder::new()
            .add_leaf(0, refund_leaf.clone())?
            .finalize(&secp, internal_key)?;

        Ok(Self {
            our_key,
            counterparty_key,
            refund_leaf,
            spend_info,
        })
    }

    /// Refund leaf script.
    pub fn refund_leaf(&self) -> &ScriptBuf {
        &self.refund_leaf
    }

    /// Control block of the refund leaf.
    pub fn control_block(&self) -> Result<ControlBlock, ProtocolError> {
        control_block(&self.spend_info, &self.refund_leaf)
    }
}

impl CooperativeTree for FundingTree {
    fn our_key(&self) -> &SecretKey {
        &self.our_key
    }

    fn counterparty_key(&self) -> &PublicKey {
        &self.counterparty_key
    }

    fn spend_info(&self) -> &TaprootSpendInfo {
        &self.spend_info
    }
}

fn control_block(spend_info: &TaprootSpendInfo, leaf: &ScriptBuf) -> Result<ControlBlock, ProtocolError> {
    spend_info
        .control_block(&(leaf.clone(), LeafVersion::TapScript))
        .ok_or(ProtocolError::General("leaf is not part of the tree"))
}

fn claim_script(kind: TreeKind, payment_hash: &sha256::Hash, claim_key: &XOnlyPublicKey) -> ScriptBuf {
    let hash160 = ripemd160::Hash::hash(payment_hash.as_byte_array());
    let mut builder = script::Builder::new();
    if kind == TreeKind::Reverse {
        builder = builder
            .push_opcode(OP_SIZE)
            .push_int(32)
            .push_opcode(OP_EQUALVERIFY);
    }
    builder
        .push_opcode(OP_HASH160)
        .push_slice(hash160.as_byte_array())
        .push_opcode(OP_EQUALVERIFY)
        .push_x_only_key(claim_key)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

fn refund_script(refund_key: &XOnlyPublicKey, timeout_block_height: u32) -> ScriptBuf {
    script::Builder::new()
        .push_x_only_key(refund_key)
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_int(timeout_block_height as i64)
        .push_opcode(OP_CLTV)
        .into_script()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::rand::thread_rng;

    fn keys() -> (SecretKey, SecretKey) {
        (
            SecretKey::new(&mut thread_rng()),
            SecretKey::new(&mut thread_rng()),
        )
    }

    #[test]
    fn test_claim_leaf_shapes() {
        let (ours, theirs) = keys();
        let secp = Secp256k1::new();
        let hash = sha256::Hash::hash(&[7u8; 32]);

        let reverse = SwapTree::new(
            TreeKind::Reverse,
            OurSide::Claim,
            ours,
            theirs.public_key(&secp),
            hash,
            500,
        )
        .unwrap();
        let submarine = SwapTree::new(
            TreeKind::Submarine,
            OurSide::Refund,
            ours,
            theirs.public_key(&secp),
            hash,
            500,
        )
        .unwrap();

        // OP_SIZE 32 OP_EQUALVERIFY prefix is 4 bytes.
        assert_eq!(
            reverse.claim_leaf().len(),
            submarine.claim_leaf().len() + 4
        );
        assert_eq!(reverse.claim_leaf().as_bytes()[0], OP_SIZE.to_u8());
        assert_eq!(submarine.claim_leaf().as_bytes()[0], OP_HASH160.to_u8());

        // Reverse claim leaf carries our key, the submarine refund leaf too.
        let our_x = ours.public_key(&secp).x_only_public_key().0.serialize();
        let contains = |script: &ScriptBuf| {
            script
                .as_bytes()
                .windows(32)
                .any(|window| window == our_x.as_slice())
        };
        assert!(contains(reverse.claim_leaf()));
        assert!(!contains(reverse.refund_leaf()));
        assert!(contains(submarine.refund_leaf()));
        assert!(!contains(submarine.claim_leaf()));
    }

    #[test]
    fn test_key_order_changes_address() {
        let (ours, theirs) = keys();
        let secp = Secp256k1::new();
        let hash = sha256::Hash::hash(b"preimage");

        let tree = SwapTree::new(
            TreeKind::Reverse,
            OurSide::Claim,
            ours,
            theirs.public_key(&secp),
            hash,
            100,
        )
        .unwrap();
        // The counterparty's view of the same tree swaps the roles but must aggregate the same way.
        let mirrored = SwapTree::new(
            TreeKind::Reverse,
            OurSide::Refund,
            theirs,
            ours.public_key(&secp),
            hash,
            100,
        )
        .unwrap();

        assert_eq!(tree.claim_leaf(), mirrored.claim_leaf());
        assert_eq!(tree.refund_leaf(), mirrored.refund_leaf());
        assert_ne!(
            tree.address(Network::Regtest),
            mirrored.address(Network::Regtest)
        );

        let address = tree.address(Network::Regtest).to_string();
        assert!(tree.check_address(&address, Network::Regtest).is_ok());
        assert!(matches!(
            mirrored.check_address(&address, Network::Regtest),
            Err(ProtocolError::AddressMismatch { .. })
        ));
    }

    #[test]
    fn test_control_blocks() {
        let (ours, theirs) = keys();
        let secp = Secp256k1::new();
        let tree = SwapTree::new(
            TreeKind::Submarine,
            OurSide::Refund,
            ours,
            theirs.public_key(&secp),
            sha256::Hash::hash(b"x"),
            42,
        )
        .unwrap();

        let output_key = tree.spend_info().output_key().to_inner();
        for leaf in [tree.claim_leaf(), tree.refund_leaf()] {
            let control_block = tree.control_block(leaf).unwrap();
            assert!(control_block.verify_taproot_commitment(&secp, output_key, leaf));
        }
        assert!(tree.control_block(&ScriptBuf::new()).is_err());

        let funding = FundingTree::new(ours, theirs.public_key(&secp), 42).unwrap();
        assert_eq!(funding.refund_leaf(), tree.refund_leaf());
        assert_ne!(funding.address(Network::Regtest), tree.address(Network::Regtest));
        let funding_key = funding.spend_info().output_key().to_inner();
        assert!(funding
            .control_block()
            .unwrap()
            .verify_taproot_commitment(&secp, funding_key, funding.refund_leaf()));
    }
}
