//! 통합 테스트 -- 이벤트 수신부터 룰 테이블 변경까지 전체 플로우 검증
//!
//! Event 수신 → 이름 필터 → 주소 조회 → 룰 삽입/삭제 → prune
//! 시나리오를 메모리 룰 저장소와 채널 이벤트 소스로 테스트합니다.

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dfm_core::pipeline::{HealthStatus, Pipeline};
use dfm_snat_guard::{
    AddressPair, AddressResolver, ChannelEventSource, ContainerEvent, MemoryRuleStore, Outcome,
    PruneOutcome, Reconciler, RuleLine, SnatGuardBuilder, SnatGuardConfig, SnatGuardConfigBuilder,
    SnatGuardError, TagScheme,
};
use proptest::prelude::*;

const HOST_TABLE: &str = "\
*nat
:PREROUTING ACCEPT [0:0]
:INPUT ACCEPT [0:0]
:OUTPUT ACCEPT [0:0]
:POSTROUTING ACCEPT [0:0]
:DOCKER - [0:0]
-A PREROUTING -m addrtype --dst-type LOCAL -j DOCKER
-A OUTPUT ! -d 127.0.0.0/8 -m addrtype --dst-type LOCAL -j DOCKER
-A POSTROUTING -s 172.17.0.0/16 ! -o docker0 -j MASQUERADE
-A POSTROUTING -o eth1 -m comment --comment \"vpn egress\" -j MASQUERADE
-A DOCKER -i docker0 -j RETURN
COMMIT
";

// Test resolver standing in for the container runtime
mod mock {
    use super::*;

    #[derive(Clone, Default)]
    pub struct TestResolver {
        containers: Arc<Mutex<BTreeMap<String, AddressPair>>>,
    }

    impl TestResolver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn run(&self, name: &str, internal: [u8; 4], external: [u8; 4]) {
            self.containers.lock().unwrap().insert(
                name.to_owned(),
                AddressPair {
                    external: Ipv4Addr::from(external),
                    internal: Ipv4Addr::from(internal),
                },
            );
        }

        pub fn kill(&self, name: &str) {
            self.containers.lock().unwrap().remove(name);
        }
    }

    impl AddressResolver for TestResolver {
        async fn resolve(&self, name: &str) -> Result<Option<AddressPair>, SnatGuardError> {
            Ok(self.containers.lock().unwrap().get(name).copied())
        }

        async fn running(&self) -> Result<Vec<String>, SnatGuardError> {
            Ok(self.containers.lock().unwrap().keys().cloned().collect())
        }
    }
}

use mock::TestResolver;

fn host_store() -> MemoryRuleStore {
    MemoryRuleStore::from_text(HOST_TABLE, &TagScheme::default()).unwrap()
}

fn config(prune_interval_ms: u64) -> SnatGuardConfig {
    SnatGuardConfigBuilder::new()
        .prune_interval_ms(prune_interval_ms)
        .sync_on_start(false)
        .build()
        .unwrap()
}

fn owned_names(store: &MemoryRuleStore) -> HashSet<String> {
    store
        .rules()
        .tags()
        .iter()
        .map(|t| t.owner().to_owned())
        .collect()
}

fn owned_line(name: &str, internal: &str, external: &str) -> String {
    format!(
        "-A POSTROUTING -s {internal}/32 -m comment --comment dfm_rule_{name} -j SNAT --to-source {external}"
    )
}

#[tokio::test]
async fn start_inserts_tagged_snat_rule() {
    let store = host_store();
    let resolver = TestResolver::new();
    resolver.run("mc1", [172, 17, 0, 2], [10, 0, 0, 5]);
    let mut reconciler = Reconciler::new(store.clone(), resolver, &config(1500)).unwrap();

    let outcome = reconciler.handle(&ContainerEvent::start("mc1")).await.unwrap();
    assert!(matches!(outcome, Outcome::Added { .. }));

    let rules = store.rules();
    let owned: Vec<_> = rules.owned().collect();
    assert_eq!(owned.len(), 1);
    let (tag, line) = owned[0];
    assert_eq!(tag.as_str(), "dfm_rule_mc1");
    assert_eq!(line.text, owned_line("mc1", "172.17.0.2", "10.0.0.5"));
    let pair = line.snat.unwrap();
    assert_eq!(pair.internal, Ipv4Addr::new(172, 17, 0, 2));
    assert_eq!(pair.external, Ipv4Addr::new(10, 0, 0, 5));
}

#[tokio::test]
async fn die_restores_previous_table() {
    let store = host_store();
    let before = store.rules();
    let resolver = TestResolver::new();
    resolver.run("mc1", [172, 17, 0, 2], [10, 0, 0, 5]);
    let mut reconciler = Reconciler::new(store.clone(), resolver.clone(), &config(1500)).unwrap();

    reconciler.handle(&ContainerEvent::start("mc1")).await.unwrap();
    resolver.kill("mc1");
    let outcome = reconciler.handle(&ContainerEvent::die("mc1")).await.unwrap();

    assert_eq!(outcome, Outcome::Removed(1));
    assert_eq!(store.rules(), before);
    assert_eq!(store.rules().render(), HOST_TABLE);
}

#[tokio::test]
async fn prune_removes_only_stale_owner() {
    let table = HOST_TABLE.replace(
        "COMMIT\n",
        &format!(
            "{}\n{}\n{}\nCOMMIT\n",
            owned_line("mc9", "172.17.0.9", "10.0.0.9"),
            owned_line("mc2", "172.17.0.3", "10.0.0.6"),
            owned_line("mc3", "172.17.0.4", "10.0.0.7"),
        ),
    );
    let store = MemoryRuleStore::from_text(&table, &TagScheme::default()).unwrap();
    let foreign_before: Vec<String> = store
        .rules()
        .foreign_lines()
        .into_iter()
        .map(str::to_owned)
        .collect();

    let resolver = TestResolver::new();
    resolver.run("mc2", [172, 17, 0, 3], [10, 0, 0, 6]);
    resolver.run("mc3", [172, 17, 0, 4], [10, 0, 0, 7]);
    let mut reconciler = Reconciler::new(store.clone(), resolver, &config(1500)).unwrap();

    assert_eq!(reconciler.prune().await.unwrap(), 1);
    assert_eq!(
        owned_names(&store),
        HashSet::from(["mc2".to_owned(), "mc3".to_owned()])
    );
    assert_eq!(store.rules().foreign_lines(), foreign_before);
}

#[tokio::test(start_paused = true)]
async fn starts_close_together_share_one_prune() {
    let store = host_store();
    let resolver = TestResolver::new();
    for (i, name) in ["mc4", "mc5", "mc6"].iter().enumerate() {
        let octet = 10 + i as u8;
        resolver.run(name, [172, 17, 0, octet], [10, 0, 0, octet]);
    }
    let mut reconciler = Reconciler::new(store.clone(), resolver, &config(1500)).unwrap();

    let first = reconciler.handle(&ContainerEvent::start("mc4")).await.unwrap();
    assert!(matches!(
        first,
        Outcome::Added {
            prune: PruneOutcome::Executed { .. },
            ..
        }
    ));

    tokio::time::advance(Duration::from_millis(200)).await;
    let second = reconciler.handle(&ContainerEvent::start("mc5")).await.unwrap();
    assert!(matches!(
        second,
        Outcome::Added {
            prune: PruneOutcome::Skipped,
            ..
        }
    ));

    tokio::time::advance(Duration::from_millis(1400)).await;
    let third = reconciler.handle(&ContainerEvent::start("mc6")).await.unwrap();
    assert!(matches!(
        third,
        Outcome::Added {
            prune: PruneOutcome::Executed { .. },
            ..
        }
    ));

    assert_eq!(owned_names(&store).len(), 3);
}

#[tokio::test]
async fn guard_ignores_unmanaged_and_keeps_running() {
    let store = host_store();
    let resolver = TestResolver::new();
    resolver.run("web1", [172, 17, 0, 7], [10, 0, 0, 7]);
    resolver.run("mc1", [172, 17, 0, 2], [10, 0, 0, 5]);
    let (source, tx) = ChannelEventSource::new(16);

    let mut guard = SnatGuardBuilder::new()
        .config(config(1500))
        .store(store.clone())
        .resolver(resolver)
        .event_source(source)
        .build()
        .unwrap();
    guard.start().await.unwrap();

    tx.send(Ok(ContainerEvent::start("web1"))).await.unwrap();
    tx.send(Ok(ContainerEvent::start("mc1"))).await.unwrap();
    drop(tx);
    guard.closed().await;

    assert_eq!(guard.events_processed(), 2);
    assert_eq!(guard.operation_failures(), 0);
    assert_eq!(owned_names(&store), HashSet::from(["mc1".to_owned()]));
    assert!(!store.rules().render().contains("web1"));
    guard.stop().await.unwrap();
}

#[tokio::test]
async fn guard_sync_on_start_converges_table() {
    let table = HOST_TABLE.replace(
        "COMMIT\n",
        &format!(
            "{}\n{}\nCOMMIT\n",
            owned_line("mc9", "172.17.0.9", "10.0.0.9"),
            owned_line("mc2", "172.17.0.3", "10.0.0.1"),
        ),
    );
    let store = MemoryRuleStore::from_text(&table, &TagScheme::default()).unwrap();
    let resolver = TestResolver::new();
    resolver.run("mc1", [172, 17, 0, 2], [10, 0, 0, 5]);
    resolver.run("mc2", [172, 17, 0, 3], [10, 0, 0, 6]);
    let (source, _tx) = ChannelEventSource::new(4);

    let mut guard = SnatGuardBuilder::new()
        .config(SnatGuardConfig {
            sync_on_start: true,
            ..config(1500)
        })
        .store(store.clone())
        .resolver(resolver)
        .event_source(source)
        .build()
        .unwrap();
    guard.start().await.unwrap();

    assert_eq!(
        owned_names(&store),
        HashSet::from(["mc1".to_owned(), "mc2".to_owned()])
    );
    let rules = store.rules();
    let mc2 = rules
        .owned()
        .find(|(tag, _)| tag.owner() == "mc2")
        .map(|(_, line)| line.snat.unwrap())
        .unwrap();
    assert_eq!(mc2.external, Ipv4Addr::new(10, 0, 0, 6));
    assert_eq!(guard.health_check().await, HealthStatus::Healthy);

    guard.stop().await.unwrap();
}

#[tokio::test]
async fn store_outage_is_contained_to_one_event() {
    let store = host_store();
    let resolver = TestResolver::new();
    resolver.run("mc1", [172, 17, 0, 2], [10, 0, 0, 5]);
    resolver.run("mc2", [172, 17, 0, 3], [10, 0, 0, 6]);
    let (source, tx) = ChannelEventSource::new(16);

    let mut guard = SnatGuardBuilder::new()
        .config(config(0))
        .store(store.clone())
        .resolver(resolver)
        .event_source(source)
        .build()
        .unwrap();
    guard.start().await.unwrap();

    store.fail_next_adds(1);
    tx.send(Ok(ContainerEvent::start("mc1"))).await.unwrap();
    tx.send(Ok(ContainerEvent::start("mc2"))).await.unwrap();
    drop(tx);
    guard.closed().await;

    assert_eq!(guard.operation_failures(), 1);
    assert_eq!(owned_names(&store), HashSet::from(["mc2".to_owned()]));
}

#[tokio::test]
async fn corrupt_table_is_never_rewritten() {
    let store = host_store();
    let resolver = TestResolver::new();
    let mut reconciler = Reconciler::new(store.clone(), resolver, &config(0)).unwrap();

    store.corrupt_next_loads(1);
    let err = reconciler.handle(&ContainerEvent::die("mc1")).await.unwrap_err();

    assert!(matches!(err, SnatGuardError::CorruptRuleSet { .. }));
    assert_eq!(store.save_calls(), 0);
    assert_eq!(store.rules().render(), HOST_TABLE);
}

#[tokio::test]
async fn concurrent_external_rule_survives_prune() {
    let table = HOST_TABLE.replace(
        "COMMIT\n",
        &format!("{}\nCOMMIT\n", owned_line("mc9", "172.17.0.9", "10.0.0.9")),
    );
    let store = MemoryRuleStore::from_text(&table, &TagScheme::default()).unwrap();
    let mut reconciler = Reconciler::new(store.clone(), TestResolver::new(), &config(0)).unwrap();

    let external = "-A POSTROUTING -s 192.168.50.0/24 -j MASQUERADE";
    store.inject_after_next_load(RuleLine::foreign(external));

    assert_eq!(reconciler.prune().await.unwrap(), 1);
    let rules = store.rules();
    assert!(rules.foreign_lines().contains(&external));
    assert!(rules.tags().is_empty());
}

#[derive(Debug, Clone)]
enum Step {
    Start(usize),
    Die(usize),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0..6usize).prop_map(Step::Start),
        (0..6usize).prop_map(Step::Die),
    ]
}

fn name(i: usize) -> String {
    // 4, 5번은 관리 대상이 아닌 이름
    match i {
        4 => "web1".to_owned(),
        5 => "mc12x".to_owned(),
        i => format!("mc{i}"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prune_converges_to_running_managed(steps in prop::collection::vec(step(), 0..24)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let store = host_store();
            let foreign_before: Vec<String> = store
                .rules()
                .foreign_lines()
                .into_iter()
                .map(str::to_owned)
                .collect();
            let resolver = TestResolver::new();
            let mut reconciler =
                Reconciler::new(store.clone(), resolver.clone(), &config(1500)).unwrap();

            for step in &steps {
                match *step {
                    Step::Start(i) => {
                        let octet = 2 + i as u8;
                        resolver.run(&name(i), [172, 17, 0, octet], [10, 0, 0, octet]);
                        reconciler.handle(&ContainerEvent::start(name(i))).await.unwrap();
                    }
                    Step::Die(i) => {
                        resolver.kill(&name(i));
                        reconciler.handle(&ContainerEvent::die(name(i))).await.unwrap();
                    }
                }
            }
            reconciler.prune().await.unwrap();

            let expected: HashSet<String> = resolver
                .running()
                .await
                .unwrap()
                .into_iter()
                .filter(|n| reconciler.matcher().is_managed(n))
                .collect();
            prop_assert_eq!(owned_names(&store), expected);
            let rules_after = store.rules();
            prop_assert_eq!(rules_after.foreign_lines(), foreign_before);
            Ok(())
        })?;
    }
}
