//! Root authority and leaf certificate cache

use catapult::{CertificateAuthority, CertificateManager, TrustStore};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn temp_dir(name: &str) -> PathBuf {
  let dir = std::env::temp_dir().join(format!("catapult-{name}-{}", std::process::id()));
  if dir.exists() {
    std::fs::remove_dir_all(&dir).ok();
  }
  dir
}

#[derive(Default)]
struct RecordingStore {
  installs: AtomicUsize,
}

impl TrustStore for RecordingStore {
  fn install(&self, ca_cert_path: &Path) -> catapult::Result<()> {
    assert!(ca_cert_path.exists());
    self.installs.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}

#[tokio::test]
async fn concurrent_requests_share_one_issuance() {
  let dir = temp_dir("single-flight");
  let manager = Arc::new(CertificateManager::new(&dir).await.unwrap());

  let tasks = (0..16).map(|_| {
    let manager = manager.clone();
    tokio::spawn(async move { manager.get_server_cert("shop.example.com").await.unwrap() })
  });
  let entries: Vec<_> = futures::future::join_all(tasks)
    .await
    .into_iter()
    .map(|joined| joined.unwrap())
    .collect();

  assert_eq!(manager.issued_count(), 1, "signed more than once");
  let first = entries[0].leaf();
  assert!(entries.iter().all(|entry| entry.leaf() == first));

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn distinct_hosts_are_each_issued_once() {
  let dir = temp_dir("distinct-hosts");
  let manager = Arc::new(CertificateManager::new(&dir).await.unwrap());
  let hosts = ["alpha.example.com", "beta.example.com"];

  let tasks = (0..16).map(|i| {
    let manager = manager.clone();
    let host = hosts[i % hosts.len()];
    tokio::spawn(async move { (host, manager.get_server_cert(host).await.unwrap()) })
  });
  let entries: Vec<_> = futures::future::join_all(tasks)
    .await
    .into_iter()
    .map(|joined| joined.unwrap())
    .collect();

  assert_eq!(manager.issued_count(), 2, "one signing per hostname expected");
  for host in hosts {
    let mut leaves = entries
      .iter()
      .filter(|(name, _)| *name == host)
      .map(|(_, entry)| entry.leaf());
    let first = leaves.next().unwrap();
    assert!(leaves.all(|leaf| leaf == first), "{host} was signed twice");
    let cached = manager.get_server_cert(host).await.unwrap();
    assert_eq!(cached.leaf(), first);
    assert_eq!(cached.hostname(), host);
  }
  let alpha = manager.get_server_cert(hosts[0]).await.unwrap();
  let beta = manager.get_server_cert(hosts[1]).await.unwrap();
  assert_ne!(alpha.leaf(), beta.leaf());
  assert_eq!(manager.issued_count(), 2);

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn warm_cache_returns_the_same_certificate() {
  let dir = temp_dir("warm-cache");
  let manager = CertificateManager::new(&dir).await.unwrap();

  let cold = manager.get_server_cert("example.com").await.unwrap();
  let warm = manager.get_server_cert("EXAMPLE.com").await.unwrap();
  assert_eq!(cold.leaf().as_ref(), warm.leaf().as_ref());
  assert_eq!(cold.cert_chain().len(), 2, "leaf and root expected");
  assert_eq!(&cold.cert_chain()[1], manager.ca_cert_der());

  manager.get_server_cert("other.example.com").await.unwrap();
  assert_eq!(manager.issued_count(), 2);

  manager.invalidate("example.com").await;
  let fresh = manager.get_server_cert("example.com").await.unwrap();
  assert_ne!(fresh.leaf().as_ref(), cold.leaf().as_ref());
  assert_eq!(manager.issued_count(), 3);

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn invalid_hostnames_are_refused() {
  let dir = temp_dir("invalid-host");
  let manager = CertificateManager::new(&dir).await.unwrap();

  assert!(manager.get_server_cert("").await.is_err());
  assert!(manager.get_server_cert("bad host.example").await.is_err());
  assert!(manager.get_server_cert("127.0.0.1").await.is_ok());

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn leaf_validity_is_configurable() {
  let dir = temp_dir("leaf-validity");
  let authority = CertificateAuthority::new(&dir).await.unwrap();
  let manager = CertificateManager::with_authority(
    authority,
    10,
    std::time::Duration::from_secs(60),
    time::Duration::days(2),
  );

  let entry = manager.get_server_cert("example.com").await.unwrap();
  let remaining = entry.not_after() - time::OffsetDateTime::now_utc();
  assert!(remaining <= time::Duration::days(2));
  assert!(remaining > time::Duration::days(1));

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn root_is_persisted_and_trusted_once() {
  let dir = temp_dir("root-persist");

  let first = CertificateManager::new(&dir).await.unwrap();
  assert!(first.authority().is_generated());
  assert!(first.needs_trust_install());
  assert!(first.ca_cert_pem().contains("BEGIN CERTIFICATE"));
  assert!(first.ca_cert_path().exists());

  let store = Arc::new(RecordingStore::default());
  assert!(first.ensure_root_trusted(store.clone()).await.unwrap());

  let second = CertificateManager::new(&dir).await.unwrap();
  assert!(!second.authority().is_generated());
  assert_eq!(first.ca_cert_pem(), second.ca_cert_pem());
  assert!(!second.needs_trust_install());
  assert!(!second.ensure_root_trusted(store.clone()).await.unwrap());
  assert_eq!(store.installs.load(Ordering::SeqCst), 1);

  std::fs::remove_dir_all(&dir).ok();
}
