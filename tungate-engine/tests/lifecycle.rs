//! Module lifecycle and network transition tests
//!
//! The tunnel client is replaced by a shell script that records its pid and
//! sleeps, so these run without privileges.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde_json::json;
use tungate_engine::{
    DataLayout, Module, NetSpec, NetworkTransitionManager, Params, Server, ServerStore,
    SettingsStore, TunnelModule, TunnelPaths,
};
use tungate_net::{RecordingRunner, ResolverFile};

struct Gateway {
    _dir: tempfile::TempDir,
    layout: DataLayout,
    store: Arc<SettingsStore>,
    tunnel: Arc<TunnelModule>,
    spawn_log: PathBuf,
}

fn fake_client(dir: &Path, spawn_log: &Path) -> PathBuf {
    let path = dir.join("fake-openvpn");
    std::fs::write(
        &path,
        format!("#!/bin/sh\necho $$ >> {}\nexec sleep 30\n", spawn_log.display()),
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn gateway() -> Gateway {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path().join("data"));
    layout.create_dirs().unwrap();
    let spawn_log = dir.path().join("spawned");
    let program = fake_client(dir.path(), &spawn_log);

    let store = Arc::new(SettingsStore::open(layout.settings_file()).unwrap());
    let servers = Arc::new(ServerStore::open(layout.servers_file()).unwrap());
    let paths = TunnelPaths::new(&layout, program.display().to_string(), "/usr/bin/tungate");
    let tunnel = Arc::new(TunnelModule::new(store.clone(), servers, paths).unwrap());

    Gateway {
        _dir: dir,
        layout,
        store,
        tunnel,
        spawn_log,
    }
}

fn server() -> Server {
    let mut endpoint = BTreeMap::new();
    endpoint.insert("name".to_string(), "fra".to_string());
    endpoint.insert("host".to_string(), "fra.vpn.example".to_string());
    Server {
        name: "example".into(),
        template: "client\nremote {{host}} 1194\n".into(),
        username: "user".into(),
        password: "pass".into(),
        endpoints: vec![endpoint],
    }
}

/// Select a server without starting anything
async fn configure(gw: &Gateway) {
    gw.tunnel.servers().save(server()).unwrap();
    let settings = json!({"enabled": false, "serverName": "example", "serverEndpoint": "fra"});
    assert!(gw.tunnel.save_settings(&Params::new(), settings).await.unwrap());
}

async fn wait_running(gw: &Gateway) -> u32 {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = gw.tunnel.status().await.unwrap();
            if let (true, Some(pid)) = (status.running, status.pid) {
                return pid;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("tunnel client did not start")
}

async fn shut_down(gw: &Gateway) {
    gw.tunnel.stop().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), gw.tunnel.process().wait_until_absent())
        .await
        .unwrap();
}

fn spawned(gw: &Gateway) -> Vec<i32> {
    std::fs::read_to_string(&gw.spawn_log)
        .unwrap_or_default()
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect()
}

#[tokio::test]
async fn test_fresh_start_spawns_client() {
    let gw = gateway();
    let status = gw.tunnel.status().await.unwrap();
    assert!(!status.running);
    assert!(status.pid.is_none());

    configure(&gw).await;
    gw.tunnel.enable(false).await.unwrap();
    assert!(!gw.tunnel.status().await.unwrap().running);

    gw.tunnel.start().await.unwrap();
    let pid = wait_running(&gw).await;

    let pid_file = std::fs::read_to_string(gw.layout.tunnel_pid_file()).unwrap();
    assert_eq!(pid_file.trim(), pid.to_string());

    shut_down(&gw).await;
    assert!(!gw.layout.tunnel_pid_file().exists());
    assert!(gw.tunnel.is_enabled());
}

#[tokio::test]
async fn test_unknown_endpoint_leaves_running_client() {
    let gw = gateway();
    configure(&gw).await;
    gw.tunnel.start().await.unwrap();
    let pid = wait_running(&gw).await;
    let writes = gw.store.writes();

    let settings = json!({"enabled": true, "serverName": "example", "serverEndpoint": "nowhere"});
    let err = gw
        .tunnel
        .save_settings(&Params::new(), settings)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = gw.tunnel.status().await.unwrap();
    assert!(status.running);
    assert_eq!(status.pid, Some(pid));
    assert_eq!(gw.store.writes(), writes);

    shut_down(&gw).await;
}

#[tokio::test]
async fn test_unchanged_settings_do_not_restart() {
    let gw = gateway();
    configure(&gw).await;
    gw.tunnel.start().await.unwrap();
    let pid = wait_running(&gw).await;
    let writes = gw.store.writes();

    let current = gw.tunnel.settings(&Params::new()).await.unwrap();
    assert!(!gw.tunnel.save_settings(&Params::new(), current).await.unwrap());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(gw.store.writes(), writes);
    assert_eq!(gw.tunnel.status().await.unwrap().pid, Some(pid));
    assert_eq!(spawned(&gw).len(), 1);

    shut_down(&gw).await;
}

#[tokio::test]
async fn test_changed_settings_force_restart() {
    let gw = gateway();
    configure(&gw).await;
    gw.tunnel.start().await.unwrap();
    let first = wait_running(&gw).await;

    let settings = json!({
        "enabled": true,
        "serverName": "example",
        "serverEndpoint": "fra",
        "logLevel": 4
    });
    assert!(gw.tunnel.save_settings(&Params::new(), settings).await.unwrap());

    let second = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let pid = wait_running(&gw).await;
            if pid != first {
                return pid;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_ne!(first, second);
    assert!(gw.tunnel.command().args.join(" ").contains("--verb 4"));

    shut_down(&gw).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_client_under_concurrent_requests() {
    let gw = gateway();
    configure(&gw).await;

    let calls = (0..16).map(|i| {
        let tunnel = gw.tunnel.clone();
        tokio::spawn(async move {
            if i % 2 == 0 {
                tunnel.start().await
            } else {
                tunnel.restart().await
            }
        })
    });
    for result in futures::future::join_all(calls).await {
        result.unwrap().unwrap();
    }

    // Let the last forced cycle settle
    let mut last = wait_running(&gw).await;
    loop {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let pid = wait_running(&gw).await;
        if pid == last {
            break;
        }
        last = pid;
    }

    let alive: Vec<i32> = spawned(&gw)
        .into_iter()
        .filter(|pid| kill(Pid::from_raw(*pid), None).is_ok())
        .collect();
    assert_eq!(alive, vec![last as i32]);

    shut_down(&gw).await;
}

fn net_spec(gateway: &str) -> NetSpec {
    NetSpec {
        domains: vec!["corp.example".into(), "lab.example".into()],
        nameservers: vec!["10.8.0.1".into(), "10.8.0.2".into()],
        device: "tun0".into(),
        gateway: gateway.into(),
    }
}

#[tokio::test]
async fn test_down_converges_after_repeated_ups() {
    let dir = tempfile::tempdir().unwrap();
    let resolv = dir.path().join("resolv.conf");
    let original = "nameserver 172.17.0.1\noptions ndots:0\n";
    std::fs::write(&resolv, original).unwrap();

    let runner = Arc::new(RecordingRunner::new());
    let resolver = ResolverFile::new(&resolv);
    let backup = resolver.backup_path().to_path_buf();
    let manager = NetworkTransitionManager::new(runner.clone(), resolver, "eth0", 80);

    manager.vpn_up(&net_spec("10.8.0.5")).await.unwrap();
    manager.vpn_up(&net_spec("10.8.0.9")).await.unwrap();
    manager.vpn_up(&net_spec("10.8.0.13")).await.unwrap();
    assert_eq!(std::fs::read_to_string(&backup).unwrap(), original);
    assert_eq!(
        std::fs::read_to_string(&resolv).unwrap(),
        "search corp.example lab.example\nnameserver 10.8.0.1\nnameserver 10.8.0.2\n"
    );

    runner.clear();
    manager.vpn_down().await.unwrap();
    let after_many = runner.calls();
    assert_eq!(std::fs::read_to_string(&resolv).unwrap(), original);
    assert!(!backup.exists());

    // A single up/down cycle ends in the same state
    manager.vpn_up(&net_spec("10.8.0.5")).await.unwrap();
    runner.clear();
    manager.vpn_down().await.unwrap();
    assert_eq!(runner.calls(), after_many);
    assert_eq!(std::fs::read_to_string(&resolv).unwrap(), original);
}

#[tokio::test]
async fn test_concurrent_edges_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let resolv = dir.path().join("resolv.conf");
    std::fs::write(&resolv, "nameserver 172.17.0.1\n").unwrap();

    let runner = Arc::new(RecordingRunner::new());
    let manager = Arc::new(NetworkTransitionManager::new(
        runner.clone(),
        ResolverFile::new(&resolv),
        "eth0",
        80,
    ));

    let up = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.vpn_up(&net_spec("10.8.0.5")).await })
    };
    let down = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.vpn_down().await })
    };
    let _ = up.await.unwrap();
    let _ = down.await.unwrap();

    // The up edge's commands form one contiguous block
    let up_block = [
        "/sbin/ip -4 route flush exact 0.0.0.0/0",
        "/sbin/ip route replace default via 10.8.0.5 dev tun0",
        "/sbin/iptables -F INPUT",
        "/sbin/iptables -A INPUT -i tun0 -m conntrack --ctstate ESTABLISHED,RELATED -j ACCEPT",
        "/sbin/iptables -A INPUT -i tun0 -j DROP",
    ];
    let calls = runner.calls();
    assert!(calls.windows(up_block.len()).any(|w| w == &up_block[..]));
    assert_eq!(calls.iter().filter(|c| c.as_str() == "/sbin/iptables -F INPUT").count(), 2);
}
