//! iptables 저장소 테스트 -- 임시 디렉터리의 가짜 iptables 도구로 검증
//!
//! 각 도구는 받은 인자를 `<tool>.args`에 한 줄씩 기록합니다. 가짜
//! `iptables-save`는 호출마다 체인 카운터와 헤더 타임스탬프를 바꿔
//! 트래픽이 흐르는 호스트를 흉내 냅니다.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use dfm_snat_guard::{
    AddressPair, AddressResolver, FirewallRule, IptablesRuleStore, Reconciler, RuleStore,
    SnatGuardConfig, SnatGuardError, TagScheme,
};
use serial_test::serial;
use tempfile::TempDir;

/// `@N@` is replaced with the call number on every dump.
const LIVE_TABLE: &str = "\
# Generated by iptables-save v1.8.7 on call @N@
*nat
:PREROUTING ACCEPT [@N@:@N@0]
:POSTROUTING ACCEPT [@N@:@N@0]
-A PREROUTING -m addrtype --dst-type LOCAL -j DOCKER
-A POSTROUTING -s 172.17.0.2/32 -m comment --comment dfm_rule_mc1 -j SNAT --to-source 10.0.0.5
-A POSTROUTING -s 172.17.0.9/32 -m comment --comment dfm_rule_mc9 -j SNAT --to-source 10.0.0.9
-A POSTROUTING -s 172.17.0.0/16 ! -o docker0 -j MASQUERADE
COMMIT
# Completed on call @N@
";

struct FakeTools {
    dir: TempDir,
}

impl FakeTools {
    fn new() -> Self {
        let tools = Self {
            dir: TempDir::new().expect("should create temp dir"),
        };
        fs::write(tools.path("table"), LIVE_TABLE).expect("should write table");

        let dir = tools.dir.path().display().to_string();
        tools.script(
            "iptables-save",
            &format!(
                r#"echo "$*" >> "{dir}/iptables-save.args"
n=$(cat "{dir}/calls" 2>/dev/null || echo 0)
n=$((n + 1))
echo "$n" > "{dir}/calls"
sed "s/@N@/$n/g" "{dir}/table"
"#
            ),
        );
        // 복원된 테이블을 다시 카운터 자리표시자로 되돌려 저장
        tools.script(
            "iptables-restore",
            &format!(
                r#"echo "$*" >> "{dir}/iptables-restore.args"
tee "{dir}/restored" | sed -e 's/\[[0-9]*:[0-9]*\]$/[@N@:@N@0]/' -e 's/on call [0-9]*$/on call @N@/' > "{dir}/table.next"
mv "{dir}/table.next" "{dir}/table"
"#
            ),
        );
        tools.script(
            "iptables",
            &format!(
                r#"echo "$*" >> "{dir}/iptables.args"
"#
            ),
        );
        tools
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn script(&self, name: &str, body: &str) {
        let path = self.path(name);
        fs::write(&path, format!("#!/bin/sh\n{body}")).expect("should write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .expect("should make script executable");
    }

    /// Replaces `name` with a tool that drains stdin, complains and exits 4.
    fn break_tool(&self, name: &str) {
        self.script(
            name,
            "cat > /dev/null\necho \"resource temporarily unavailable\" >&2\nexit 4\n",
        );
    }

    fn read(&self, name: &str) -> String {
        fs::read_to_string(self.path(name)).unwrap_or_default()
    }

    fn config(&self) -> SnatGuardConfig {
        let binary = |name: &str| self.path(name).display().to_string();
        SnatGuardConfig {
            save_binary: binary("iptables-save"),
            restore_binary: binary("iptables-restore"),
            iptables_binary: binary("iptables"),
            wait_lock: true,
            ..SnatGuardConfig::default()
        }
    }

    fn store(&self) -> IptablesRuleStore {
        IptablesRuleStore::new(&self.config())
    }
}

/// Resolver reporting a fixed running set.
struct RunningSet(Vec<String>);

impl AddressResolver for RunningSet {
    async fn resolve(&self, _name: &str) -> Result<Option<AddressPair>, SnatGuardError> {
        Ok(None)
    }

    async fn running(&self) -> Result<Vec<String>, SnatGuardError> {
        Ok(self.0.clone())
    }
}

fn tag(name: &str) -> dfm_snat_guard::Tag {
    TagScheme::default().tag_for(name)
}

#[tokio::test]
#[serial]
async fn test_load_reads_nat_table_with_counters() {
    let tools = FakeTools::new();

    let rules = tools.store().load().await.expect("load should succeed");

    assert_eq!(tools.read("iptables-save.args"), "-t nat\n");
    assert!(rules.contains_tag(&tag("mc1")));
    assert!(rules.contains_tag(&tag("mc9")));
    let (_, line) = rules
        .owned()
        .find(|(t, _)| t.owner() == "mc1")
        .expect("mc1 rule");
    assert_eq!(
        line.snat,
        Some(AddressPair {
            internal: "172.17.0.2".parse().unwrap(),
            external: "10.0.0.5".parse().unwrap(),
        })
    );
    assert!(
        rules
            .lines()
            .iter()
            .any(|l| l.text == ":POSTROUTING ACCEPT [1:10]")
    );
}

#[tokio::test]
#[serial]
async fn test_consecutive_dumps_hold_same_rules() {
    let tools = FakeTools::new();
    let store = tools.store();

    let first = store.load().await.unwrap();
    let second = store.load().await.unwrap();

    assert_ne!(first, second, "counters and header should move");
    assert!(first.same_rules(&second));
}

#[tokio::test]
#[serial]
async fn test_save_pipes_rendered_table_with_wait_flag() {
    let tools = FakeTools::new();
    let store = tools.store();
    let mut rules = store.load().await.unwrap();
    rules.remove_tag(&tag("mc9"));

    store.save(&rules).await.expect("save should succeed");

    assert_eq!(tools.read("iptables-restore.args"), "-w\n");
    assert_eq!(tools.read("restored"), rules.render());
}

#[tokio::test]
#[serial]
async fn test_save_without_wait_lock_passes_no_flags() {
    let tools = FakeTools::new();
    let store = IptablesRuleStore::new(&SnatGuardConfig {
        wait_lock: false,
        ..tools.config()
    });
    let rules = store.load().await.unwrap();

    store.save(&rules).await.unwrap();

    assert_eq!(tools.read("iptables-restore.args"), "\n");
}

#[tokio::test]
#[serial]
async fn test_add_passes_lock_flag_before_insert_args() {
    let tools = FakeTools::new();
    let rule = FirewallRule::new(
        tag("mc3"),
        "POSTROUTING",
        AddressPair {
            internal: "172.17.0.4".parse().unwrap(),
            external: "10.0.0.7".parse().unwrap(),
        },
    );

    tools.store().add(&rule).await.expect("add should succeed");

    assert_eq!(
        tools.read("iptables.args"),
        "-w -t nat -I POSTROUTING -s 172.17.0.4 -m comment --comment dfm_rule_mc3 -j SNAT --to-source 10.0.0.7\n"
    );
}

#[tokio::test]
#[serial]
async fn test_tool_failures_map_to_store_unavailable() {
    let tools = FakeTools::new();
    let store = tools.store();
    let rules = store.load().await.unwrap();
    let rule = FirewallRule::new(
        tag("mc3"),
        "POSTROUTING",
        AddressPair {
            internal: "172.17.0.4".parse().unwrap(),
            external: "10.0.0.7".parse().unwrap(),
        },
    );
    for name in ["iptables-save", "iptables-restore", "iptables"] {
        tools.break_tool(name);
    }

    let errors = [
        store.load().await.map(|_| ()),
        store.save(&rules).await,
        store.add(&rule).await,
    ];

    for result in errors {
        match result {
            Err(SnatGuardError::StoreUnavailable(msg)) => {
                assert!(msg.contains("resource temporarily unavailable"), "got: {msg}");
            }
            other => panic!("expected StoreUnavailable, got {other:?}"),
        }
    }
}

#[tokio::test]
#[serial]
async fn test_unparsable_dump_is_corrupt() {
    let tools = FakeTools::new();
    fs::write(tools.path("table"), "*nat\n-A POSTROUTING -j ACCEPT\n").unwrap();

    let err = tools.store().load().await.unwrap_err();

    assert!(matches!(err, SnatGuardError::CorruptRuleSet { line: 2, .. }));
}

#[tokio::test]
#[serial]
async fn test_removal_and_prune_converge_while_counters_move() {
    let tools = FakeTools::new();
    let config = tools.config();
    let store = IptablesRuleStore::new(&config);
    let mut reconciler = Reconciler::new(store, RunningSet(Vec::new()), &config).unwrap();

    assert_eq!(reconciler.remove(&tag("mc1")).await.unwrap(), 1);
    assert_eq!(reconciler.prune().await.unwrap(), 1);

    let table = tools.read("restored");
    assert!(!table.contains("dfm_rule_"), "got: {table}");
    assert!(table.contains("-A POSTROUTING -s 172.17.0.0/16 ! -o docker0 -j MASQUERADE"));
    assert!(table.contains("-A PREROUTING -m addrtype --dst-type LOCAL -j DOCKER"));
    assert_eq!(tools.read("iptables-restore.args").lines().count(), 2);
}
