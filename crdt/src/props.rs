//! Cross-module convergence properties.
use crate::{
    Engine, EngineConfig, Filter, Keypair, NodeId, Op, OrderKey, Proof, SignedOp,
};
use proptest::prelude::*;
use smallvec::smallvec;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_log::LogTracer::init().ok();
    let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(env))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
    log_panics::init();
}

/// Compact description of one random op; expanded against a key set so every
/// op has a unique `(replica, counter)` and a valid signature.
#[derive(Clone, Debug)]
struct OpShape {
    kind: u8,
    node: u8,
    parent: u8,
    digit: u16,
    lamport: u8,
    with_payload: bool,
}

fn arb_shape() -> impl Strategy<Value = OpShape> {
    (0u8..5, 1u8..6, 0u8..6, 1u16..100, 1u8..8, any::<bool>()).prop_map(
        |(kind, node, parent, digit, lamport, with_payload)| OpShape {
            kind,
            node,
            parent,
            digit,
            lamport,
            with_payload,
        },
    )
}

fn node(b: u8) -> NodeId {
    NodeId::new([b; 16])
}

fn expand(shapes: &[OpShape], keys: &[Keypair]) -> Vec<SignedOp> {
    shapes
        .iter()
        .enumerate()
        .map(|(i, shape)| {
            let key = keys[i % keys.len()];
            let replica = key.replica_id();
            let counter = (i / keys.len()) as u64 + 1;
            let lamport = shape.lamport as u64;
            let target = node(shape.node);
            let parent = if shape.parent == 0 || shape.parent == shape.node {
                NodeId::ROOT
            } else {
                node(shape.parent)
            };
            let order_key = OrderKey::new(smallvec![shape.digit]);
            let payload = shape.with_payload.then(|| vec![shape.digit as u8]);
            let op = match shape.kind {
                0 => Op::insert(replica, counter, lamport, parent, target, order_key, payload),
                1 => Op::move_node(replica, counter, lamport, target, parent, order_key),
                2 => Op::payload(replica, counter, lamport, target, payload),
                3 => Op::delete(replica, counter, lamport, target, None),
                _ => Op::tombstone(replica, counter, lamport, target),
            };
            SignedOp::sign(key, "doc", op, Proof::None).expect("own key")
        })
        .collect()
}

fn snapshot(engine: &Engine) -> (Vec<crate::TreeRow>, Vec<crate::OpRef>, u64) {
    (
        engine.tree_dump(),
        engine.list_op_refs(&Filter::All).into_iter().collect(),
        engine.tree_node_count(),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Any permutation of arrivals, in any batch sizes, converges.
    #[test]
    fn permutation_convergence(
        shapes in prop::collection::vec(arb_shape(), 1..14),
        seed in any::<u64>(),
    ) {
        init_tracing();
        let keys = [Keypair::generate(), Keypair::generate()];
        let ops = expand(&shapes, &keys);

        let mut all_at_once = Engine::new("doc", EngineConfig::default());
        all_at_once.apply_ops(ops.clone());

        // A deterministic shuffle of the same set, applied one op at a time.
        let mut shuffled = ops;
        let mut state = seed | 1;
        for i in (1..shuffled.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let j = (state >> 33) as usize % (i + 1);
            shuffled.swap(i, j);
        }
        let mut one_by_one = Engine::new("doc", EngineConfig::default());
        for op in shuffled {
            one_by_one.apply_ops(vec![op]);
        }

        let structure = all_at_once.tree().validate();
        prop_assert!(structure.is_ok(), "{:?}", structure);
        prop_assert_eq!(snapshot(&all_at_once), snapshot(&one_by_one));
    }

    /// Replaying any subset of an already applied set changes nothing.
    #[test]
    fn reapply_is_idempotent(
        shapes in prop::collection::vec(arb_shape(), 1..10),
        take in any::<u8>(),
    ) {
        let keys = [Keypair::generate(), Keypair::generate()];
        let ops = expand(&shapes, &keys);
        let mut engine = Engine::new("doc", EngineConfig::default());
        engine.apply_ops(ops.clone());
        let before = snapshot(&engine);
        let n = (take as usize % ops.len()) + 1;
        let report = engine.apply_ops(ops.into_iter().take(n).collect());
        prop_assert!(report.applied.is_empty());
        prop_assert_eq!(before, snapshot(&engine));
    }

    /// Two engines exchanging their logs end up identical.
    #[test]
    fn merge_is_symmetric(
        left in prop::collection::vec(arb_shape(), 1..8),
        right in prop::collection::vec(arb_shape(), 1..8),
    ) {
        let ka = [Keypair::generate()];
        let kb = [Keypair::generate()];
        let left = expand(&left, &ka);
        let right = expand(&right, &kb);

        let mut a = Engine::new("doc", EngineConfig::default());
        let mut b = Engine::new("doc", EngineConfig::default());
        a.apply_ops(left.clone());
        b.apply_ops(right.clone());
        a.apply_ops(right);
        b.apply_ops(left);

        prop_assert_eq!(snapshot(&a), snapshot(&b));
    }
}
