#![allow(dead_code)]

use std::sync::Arc;

use approval_flow_core::{
    load_definition_yaml, ApprovalStore, DefinitionDraft, EntitySnapshot, StaticDirectory,
};
use approval_flow_runtime::{
    ApprovalRuntime, EntityAdapterRegistry, ManualClock, StaticEntityAdapter,
};
use time::macros::datetime;
use time::OffsetDateTime;

pub const SINGLE_STEP: &str = r"
code: po-single
version: 1
name: Single approver
entity_type: purchase_order
steps:
  - id: review
    sequence: 1
    name: Review
    approver_rule:
      kind: user
      user: alice
transitions:
  - to_step: review
  - from_step: review
";

pub const TWO_STEP: &str = r"
code: po-two-step
version: 1
name: Manager then finance
entity_type: purchase_order
steps:
  - id: first
    sequence: 1
    name: First review
    approver_rule:
      kind: user
      user: alice
  - id: second
    sequence: 2
    name: Finance
    approver_rule:
      kind: role
      role: finance
    quorum: 2
transitions:
  - to_step: first
  - from_step: first
    to_step: second
  - from_step: second
";

pub const PAIR_VETO: &str = r"
code: po-pair
version: 1
name: Two reviewers
entity_type: purchase_order
steps:
  - id: pair
    sequence: 1
    name: Pair review
    approver_rule:
      kind: role
      role: pair
    quorum: 2
transitions:
  - to_step: pair
  - from_step: pair
";

pub const TIMED: &str = r"
code: po-timed
version: 1
name: Reviewed within an hour
entity_type: purchase_order
steps:
  - id: review
    sequence: 1
    name: Review
    approver_rule:
      kind: user
      user: alice
    timeout_secs: 3600
transitions:
  - to_step: review
  - from_step: review
";

pub const PANEL: &str = r"
code: po-panel
version: 1
name: Five member panel
entity_type: purchase_order
steps:
  - id: panel
    sequence: 1
    name: Panel vote
    approver_rule:
      kind: role
      role: panel
    quorum: 3
transitions:
  - to_step: panel
  - from_step: panel
";

pub const PANEL_MEMBERS: [&str; 5] = ["ann", "ben", "cat", "dan", "eve"];

pub fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("unexpected error: {err}"),
    }
}

pub fn draft(yaml: &str) -> DefinitionDraft {
    must(load_definition_yaml(yaml))
}

pub fn epoch() -> OffsetDateTime {
    datetime!(2026-03-02 09:00 UTC)
}

pub fn directory() -> StaticDirectory {
    StaticDirectory::new()
        .with_role("finance", ["bob", "carol"])
        .with_role("pair", ["alice", "bob"])
        .with_role("panel", PANEL_MEMBERS)
        .with_role("cfo", ["carla"])
        .with_manager("rita", "mark")
}

/// Purchase orders `po-1` .. `po-9`, each with an amount and a department.
pub fn purchase_orders() -> Arc<StaticEntityAdapter> {
    let adapter = StaticEntityAdapter::new("purchase_order");
    for index in 1..=9_u32 {
        adapter.insert(
            format!("po-{index}"),
            EntitySnapshot::new()
                .with("amount", f64::from(index) * 1000.0)
                .with("department", "operations"),
        );
    }
    Arc::new(adapter)
}

pub fn registry(adapter: &Arc<StaticEntityAdapter>) -> EntityAdapterRegistry {
    let mut registry = EntityAdapterRegistry::new();
    registry.register(adapter.clone());
    registry
}

pub fn runtime_with<S: ApprovalStore>(
    store: S,
    clock: &ManualClock,
    adapter: &Arc<StaticEntityAdapter>,
) -> ApprovalRuntime<S> {
    must(
        ApprovalRuntime::builder(store)
            .adapters(registry(adapter))
            .directory(directory())
            .clock(clock.clone())
            .build(),
    )
}
