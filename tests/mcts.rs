//! End-to-end MCTS scenarios: full self-play games against a mock
//! evaluator, mate proving, principal-variation maintenance, node-pool
//! accounting and cache interaction.

use kestrel::cache::{PredictionCache, MAX_CACHED_MOVES};
use kestrel::config::Config;
use kestrel::game::{Mv, VALUE_DRAW, VALUE_WIN};
use kestrel::position::{ChessPosition, STARTING_POSITION};
use kestrel::search::arena::{NodeArena, NodeId};
use kestrel::search::game::{SearchGame, SelfPlayState};
use kestrel::search::node::{Node, TerminalValue};
use kestrel::search::worker::{backpropagate, backpropagate_mate, worse_than, SearchState, SearchWorker};
use std::sync::Arc;

const MAX_MOVES: i32 = 24;

fn test_config() -> Config {
    let mut config = Config::default();
    config.self_play.prediction_batch_size = 1;
    config.self_play.num_simulations = 12;
    config.self_play.num_sampling_moves = 6;
    config.self_play.max_moves = MAX_MOVES;
    config
}

fn test_worker() -> SearchWorker<ChessPosition> {
    SearchWorker::new(
        test_config(),
        Arc::new(PredictionCache::with_bytes(1 << 20)),
    )
}

/// Drive slot 0 to the end of a game, standing in for the network with a
/// draw value and uniform (zero-logit) policy, calling `tick` after each
/// pretend prediction.
fn play_game(
    worker: &mut SearchWorker<ChessPosition>,
    mut tick: impl FnMut(&mut SearchWorker<ChessPosition>),
) {
    worker.set_up_game(0);
    loop {
        worker.play(0);
        if worker.state(0) == SelfPlayState::Finished {
            return;
        }
        worker.values_mut()[0] = 0.0;
        for plane in worker.policies_mut()[0].iter_mut() {
            plane.fill(0.0);
        }
        tick(worker);
    }
}

fn mock_expand(arena: &mut NodeArena, node: NodeId, count: usize) {
    let prior = 1.0 / count as f32;
    for i in 0..count {
        let child = arena.alloc(prior);
        arena.node_mut(node).children.push((Mv(i as u16 + 1), child));
    }
}

fn child(arena: &NodeArena, node: NodeId, index: usize) -> NodeId {
    arena.node(node).children[index].1
}

fn check_mate_n(node: &Node, n: i32) {
    assert!(n >= 1);
    assert_eq!(node.terminal.is_immediate(), n == 1);
    assert_eq!(
        node.terminal.immediate_value(),
        if n == 1 { VALUE_WIN } else { VALUE_DRAW }
    );
    assert!(node.terminal.is_mate_in_n());
    assert!(!node.terminal.is_opponent_mate_in_n());
    assert_eq!(node.terminal.mate_n(), n);
    assert_eq!(node.terminal.opponent_mate_n(), 0);
    assert_eq!(node.terminal.either_mate_n(), n);
}

fn check_opponent_mate_n(node: &Node, n: i32) {
    assert!(n >= 1);
    assert!(!node.terminal.is_immediate());
    assert_eq!(node.terminal.immediate_value(), VALUE_DRAW);
    assert!(!node.terminal.is_mate_in_n());
    assert!(node.terminal.is_opponent_mate_in_n());
    assert_eq!(node.terminal.mate_n(), 0);
    assert_eq!(node.terminal.opponent_mate_n(), n);
    assert_eq!(node.terminal.either_mate_n(), -n);
}

fn check_non_terminal(node: &Node) {
    assert!(!node.terminal.is_immediate());
    assert_eq!(node.terminal.immediate_value(), VALUE_DRAW);
    assert_eq!(node.terminal.either_mate_n(), 0);
}

#[test]
fn node_pool_returns_to_zero_after_game() {
    let mut worker = test_worker();
    assert_eq!(worker.arena().current_allocations(), 0);
    assert_eq!(worker.arena().peak_allocations(), 0);

    play_game(&mut worker, |_| {});

    assert_eq!(worker.arena().current_allocations(), 0);
    assert!(worker.arena().peak_allocations() > 0);
}

/// The PV chain from the root, asserting along the way that no visited
/// child beats its parent's best child.
fn generate_principal_variation(worker: &SearchWorker<ChessPosition>) -> Vec<NodeId> {
    let arena = worker.arena();
    let mut principal_variation = Vec::new();
    let Some(mut node_id) = worker.game(0).root() else {
        return principal_variation;
    };
    loop {
        let node = arena.node(node_id);
        for (_, child_id) in &node.children {
            if arena.node(*child_id).visit_count > 0 {
                let best = node.best_child.map(|(_, id)| arena.node(id));
                assert!(
                    !worse_than(best, arena.node(*child_id), MAX_MOVES),
                    "best child is worse than a visited sibling"
                );
            }
        }
        match node.best_child {
            Some((_, next)) => {
                principal_variation.push(next);
                node_id = next;
            }
            None => break,
        }
    }
    principal_variation
}

#[test]
fn principal_variation_only_changes_when_flagged() {
    let mut worker = test_worker();
    let mut latest: Vec<NodeId> = Vec::new();
    let mut first = true;

    play_game(&mut worker, |worker| {
        let principal_variation = generate_principal_variation(worker);
        if worker.search_state().principal_variation_changed {
            worker.search_state_mut().principal_variation_changed = false;
        } else if !first {
            assert_eq!(
                principal_variation, latest,
                "PV changed without the change flag"
            );
        }
        latest = principal_variation;
        first = false;
    });
}

#[test]
fn mate_proving_through_a_small_tree() {
    let mut arena = NodeArena::new();
    let mut search_state = SearchState::default();
    let root = arena.alloc(0.0);

    // 1 root, 3 ply-1 children, 9 ply-2 grandchildren.
    mock_expand(&mut arena, root, 3);
    for i in 0..3 {
        let ply1 = child(&arena, root, i);
        mock_expand(&mut arena, ply1, 3);
    }

    // Selectively deepen two leaves.
    let c11 = child(&arena, child(&arena, root, 1), 1);
    mock_expand(&mut arena, c11, 1);
    let c110 = child(&arena, c11, 0);
    mock_expand(&mut arena, c110, 1);

    let c22 = child(&arena, child(&arena, root, 2), 2);
    mock_expand(&mut arena, c22, 1);
    let c220 = child(&arena, c22, 0);
    mock_expand(&mut arena, c220, 1);
    let c2200 = child(&arena, c220, 0);
    mock_expand(&mut arena, c2200, 1);
    let c22000 = child(&arena, c2200, 0);
    mock_expand(&mut arena, c22000, 1);

    check_non_terminal(arena.node(root));
    let c0 = child(&arena, root, 0);
    let c00 = child(&arena, c0, 0);
    check_non_terminal(arena.node(c00));

    // Mark ply-2 child (0, 0) as mate-in-1 and backpropagate.
    arena.node_mut(c00).terminal = TerminalValue::MateIn(1);
    backpropagate_mate(
        &mut arena,
        &[(Mv::NONE, root), (Mv(1), c0), (Mv(1), c00)],
        MAX_MOVES,
        &mut search_state,
    );
    check_mate_n(arena.node(c00), 1);
    check_opponent_mate_n(arena.node(c0), 1);
    check_non_terminal(arena.node(root));

    // Mark the leaf under (1, 1) as mate-in-1: (1, 1) becomes mate-in-2 and
    // (1) opponent-mate-in-2; the root stays open.
    let c1 = child(&arena, root, 1);
    let c1100 = child(&arena, c110, 0);
    arena.node_mut(c1100).terminal = TerminalValue::MateIn(1);
    backpropagate_mate(
        &mut arena,
        &[
            (Mv::NONE, root),
            (Mv(2), c1),
            (Mv(2), c11),
            (Mv(1), c110),
            (Mv(1), c1100),
        ],
        MAX_MOVES,
        &mut search_state,
    );
    check_mate_n(arena.node(c1100), 1);
    check_opponent_mate_n(arena.node(c110), 1);
    check_mate_n(arena.node(c11), 2);
    check_opponent_mate_n(arena.node(c1), 2);
    check_non_terminal(arena.node(root));

    // Mark the deep leaf under (2, 2): every root child is now an opponent
    // mate, so the root becomes mate-in-4.
    let c2 = child(&arena, root, 2);
    let c220000 = child(&arena, c22000, 0);
    arena.node_mut(c220000).terminal = TerminalValue::MateIn(1);
    backpropagate_mate(
        &mut arena,
        &[
            (Mv::NONE, root),
            (Mv(3), c2),
            (Mv(3), c22),
            (Mv(1), c220),
            (Mv(1), c2200),
            (Mv(1), c22000),
            (Mv(1), c220000),
        ],
        MAX_MOVES,
        &mut search_state,
    );
    check_mate_n(arena.node(c220000), 1);
    check_opponent_mate_n(arena.node(c22000), 1);
    check_mate_n(arena.node(c2200), 2);
    check_opponent_mate_n(arena.node(c220), 2);
    check_mate_n(arena.node(c22), 3);
    check_opponent_mate_n(arena.node(c2), 3);
    check_mate_n(arena.node(root), 4);

    arena.prune_all(root);
    assert_eq!(arena.current_allocations(), 0);
}

/// One simulation at an unexpanded root with a draw-valued, uniform-policy
/// evaluation: 20 children at prior 1/20, one visit worth 0.5.
#[test]
fn first_simulation_from_the_starting_position() {
    let config = test_config();
    let cache = PredictionCache::with_bytes(1 << 20);
    let mut arena = NodeArena::new();
    let mut game: SearchGame<ChessPosition> =
        SearchGame::from_fen(&mut arena, STARTING_POSITION, &[], false).unwrap();

    let mut state = SelfPlayState::Working;
    let mut image = kestrel::game::zeroed_input_planes();
    let policy = kestrel::game::zeroed_output_planes();
    let mut cache_store = None;

    let root = game.root_id();
    arena.node_mut(root).visiting_count += 1;

    let parked = game.expand_and_evaluate(
        &mut state,
        &mut arena,
        &cache,
        &config.misc,
        &mut image,
        0.0,
        &policy,
        &mut cache_store,
    );
    assert!(parked.is_nan());
    assert_eq!(state, SelfPlayState::WaitingForPrediction);

    // tanh 0.0 -> 0.5, flipped to the parent perspective -> 0.5.
    let value = game.expand_and_evaluate(
        &mut state,
        &mut arena,
        &cache,
        &config.misc,
        &mut image,
        0.0,
        &policy,
        &mut cache_store,
    );
    assert_eq!(state, SelfPlayState::Working);
    assert_eq!(value, 0.5);

    let root_node = arena.node(root);
    assert_eq!(root_node.children.len(), 20);
    for (_, child_id) in &root_node.children {
        assert!((arena.node(*child_id).prior - 0.05).abs() < 1e-6);
    }

    backpropagate(&mut arena, &[(Mv::NONE, root)], value);
    let root_node = arena.node(root);
    assert_eq!(root_node.visit_count, 1);
    assert_eq!(root_node.visiting_count, 0);
    assert!((root_node.value_sum - 0.5).abs() < 1e-6);
}

/// Twofold repetition relative to the search root: the same final position
/// is a draw when the repetition happened inside the search, and a plain
/// prediction request when the search root is snapped past it.
#[test]
fn repetition_draw_depends_on_search_root() {
    let line: Vec<Mv> = ["e2e4", "d7d6", "d1g4", "g8f6", "g4d1", "f6g8", "d1g4"]
        .iter()
        .map(|m| Mv::parse_uci(m).unwrap())
        .collect();

    let config = test_config();
    let cache = PredictionCache::with_bytes(1 << 20);
    let mut image = kestrel::game::zeroed_input_planes();
    let policy = kestrel::game::zeroed_output_planes();

    // Search root at the starting position: the draw is claimable.
    {
        let mut arena = NodeArena::new();
        let mut game: SearchGame<ChessPosition> =
            SearchGame::from_fen(&mut arena, STARTING_POSITION, &line, false).unwrap();
        let mut state = SelfPlayState::Working;
        let mut cache_store = None;
        let value = game.expand_and_evaluate(
            &mut state,
            &mut arena,
            &cache,
            &config.misc,
            &mut image,
            0.0,
            &policy,
            &mut cache_store,
        );
        assert_eq!(state, SelfPlayState::Working);
        assert_eq!(value, VALUE_DRAW);
        assert_eq!(arena.node(game.root_id()).terminal, TerminalValue::Draw);
    }

    // Search root snapped after six moves: the earlier occurrence predates
    // the search, so no claim; the leaf asks for a prediction instead.
    {
        let mut arena = NodeArena::new();
        let base: SearchGame<ChessPosition> =
            SearchGame::from_fen(&mut arena, STARTING_POSITION, &line[..6], false).unwrap();
        let mut scratch: SearchGame<ChessPosition> = SearchGame::empty();
        scratch.clone_scratch_from(&base);
        let leaf = arena.alloc(0.0);
        scratch.apply_move_with_root(line[6], Some(leaf));

        let mut state = SelfPlayState::Working;
        let mut cache_store = None;
        let value = scratch.expand_and_evaluate(
            &mut state,
            &mut arena,
            &cache,
            &config.misc,
            &mut image,
            0.0,
            &policy,
            &mut cache_store,
        );
        assert!(value.is_nan());
        assert_eq!(state, SelfPlayState::WaitingForPrediction);
        assert_eq!(
            arena.node(scratch.root_id()).terminal,
            TerminalValue::NonTerminal
        );
    }
}

#[test]
fn checkmate_expands_to_mate_in_one() {
    // Fool's mate: White to move, already mated.
    let fen = "rnb1kbnr/pppp1ppp/8/4p3/6Pq/5P2/PPPPP2P/RNBQKBNR w KQkq - 1 3";
    let config = test_config();
    let cache = PredictionCache::with_bytes(1 << 20);
    let mut arena = NodeArena::new();
    let mut game: SearchGame<ChessPosition> =
        SearchGame::from_fen(&mut arena, fen, &[], false).unwrap();

    let mut state = SelfPlayState::Working;
    let mut image = kestrel::game::zeroed_input_planes();
    let policy = kestrel::game::zeroed_output_planes();
    let mut cache_store = None;
    let value = game.expand_and_evaluate(
        &mut state,
        &mut arena,
        &cache,
        &config.misc,
        &mut image,
        0.0,
        &policy,
        &mut cache_store,
    );

    assert_eq!(value, VALUE_WIN);
    assert_eq!(state, SelfPlayState::Working);
    let root = arena.node(game.root_id());
    assert_eq!(root.terminal, TerminalValue::MateIn(1));
    assert!(root.children.is_empty());
}

#[test]
fn stalemate_expands_to_draw() {
    let fen = "7k/5Q2/6K1/8/8/8/8/8 b - - 0 1";
    let config = test_config();
    let cache = PredictionCache::with_bytes(1 << 20);
    let mut arena = NodeArena::new();
    let mut game: SearchGame<ChessPosition> =
        SearchGame::from_fen(&mut arena, fen, &[], false).unwrap();

    let mut state = SelfPlayState::Working;
    let mut image = kestrel::game::zeroed_input_planes();
    let policy = kestrel::game::zeroed_output_planes();
    let mut cache_store = None;
    let value = game.expand_and_evaluate(
        &mut state,
        &mut arena,
        &cache,
        &config.misc,
        &mut image,
        0.0,
        &policy,
        &mut cache_store,
    );

    assert_eq!(value, VALUE_DRAW);
    let root = arena.node(game.root_id());
    assert_eq!(root.terminal, TerminalValue::Draw);
    assert!(root.children.is_empty());
}

/// A position with far more legal moves than the cache can hold: the stored
/// entry and the expanded children both cap at the branch limit, keeping the
/// highest priors, and a rebuilt game expands identically from the cache.
#[test]
fn wide_position_caps_cached_branching() {
    // 218 legal moves for White.
    let fen = "R6R/3Q4/1Q4Q1/4Q3/2Q4Q/Q4Q2/pp1Q4/kBNN1KB1 w - - 0 1";
    let config = test_config();
    let cache = PredictionCache::with_bytes(1 << 20);
    let mut image = kestrel::game::zeroed_input_planes();
    let policy = kestrel::game::zeroed_output_planes();

    let mut arena = NodeArena::new();
    let mut game: SearchGame<ChessPosition> =
        SearchGame::from_fen(&mut arena, fen, &[], true).unwrap();
    let mut state = SelfPlayState::Working;
    let mut cache_store = None;

    let parked = game.expand_and_evaluate(
        &mut state,
        &mut arena,
        &cache,
        &config.misc,
        &mut image,
        0.0,
        &policy,
        &mut cache_store,
    );
    assert!(parked.is_nan());
    let value = game.expand_and_evaluate(
        &mut state,
        &mut arena,
        &cache,
        &config.misc,
        &mut image,
        0.0,
        &policy,
        &mut cache_store,
    );

    let first_children: Vec<(Mv, f32)> = arena
        .node(game.root_id())
        .children
        .iter()
        .map(|(mv, id)| (*mv, arena.node(*id).prior))
        .collect();
    assert_eq!(first_children.len(), MAX_CACHED_MOVES);

    // Fresh tree, same position: the evaluation comes straight off the
    // cache with the same surviving moves and quantized priors.
    let mut second_arena = NodeArena::new();
    let mut second: SearchGame<ChessPosition> =
        SearchGame::from_fen(&mut second_arena, fen, &[], true).unwrap();
    let mut second_state = SelfPlayState::Working;
    let mut second_store = None;
    let cached_value = second.expand_and_evaluate(
        &mut second_state,
        &mut second_arena,
        &cache,
        &config.misc,
        &mut image,
        0.0,
        &policy,
        &mut second_store,
    );
    assert_eq!(second_state, SelfPlayState::Working);
    assert_eq!(cached_value, value);

    let second_children: Vec<(Mv, f32)> = second_arena
        .node(second.root_id())
        .children
        .iter()
        .map(|(mv, id)| (*mv, second_arena.node(*id).prior))
        .collect();
    assert_eq!(second_children.len(), MAX_CACHED_MOVES);
    for ((mv_a, prior_a), (mv_b, prior_b)) in first_children.iter().zip(&second_children) {
        assert_eq!(mv_a, mv_b);
        assert!((prior_a - prior_b).abs() <= 1.0 / 255.0);
    }
}

/// Invariant: at every quiescent point, an expanded root's visits equal the
/// sum of its children's, and every other expanded node carries exactly one
/// extra visit from its stint as a leaf. Runs across two games so the second
/// game's roots expand via cache hits, the combination the visit-accounting
/// decrement has to survive.
#[test]
fn visit_counts_stay_consistent_with_cache_hits() {
    fn check_visit_sums(worker: &SearchWorker<ChessPosition>) {
        let arena = worker.arena();
        let Some(root) = worker.game(0).root() else {
            return;
        };
        let mut pending = vec![(root, true)];
        while let Some((node_id, is_root)) = pending.pop() {
            let node = arena.node(node_id);
            if !node.is_expanded() {
                continue;
            }
            let child_sum: i32 = node
                .children
                .iter()
                .map(|(_, child)| arena.node(*child).visit_count)
                .sum();
            let expected = if is_root { child_sum } else { child_sum + 1 };
            assert_eq!(
                node.visit_count, expected,
                "visit accounting broken (root: {})",
                is_root
            );
            pending.extend(node.children.iter().map(|(_, child)| (*child, false)));
        }
    }

    let mut worker = test_worker();
    play_game(&mut worker, |worker| check_visit_sums(worker));
    // Second game: early roots now hit the prediction cache.
    play_game(&mut worker, |worker| check_visit_sums(worker));
    assert!(worker.cache().permille_hits() > 0);
}
