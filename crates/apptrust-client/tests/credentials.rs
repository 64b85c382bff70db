use std::path::PathBuf;
use std::sync::Mutex;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn create_temp_dir(prefix: &str) -> PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let base = std::env::temp_dir();
    let pid = std::process::id();
    for _ in 0..10_000 {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = base.join(format!("{prefix}_{pid}_{n}"));
        if std::fs::create_dir(&path).is_ok() {
            return path;
        }
    }
    panic!("failed to create temp dir under {}", base.display());
}

fn rm_rf(path: &std::path::Path) {
    let _ = std::fs::remove_dir_all(path);
}

struct EnvGuard {
    saved: Vec<(&'static str, Option<String>)>,
}

impl EnvGuard {
    fn set(vars: &[(&'static str, Option<&str>)]) -> Self {
        let mut saved = Vec::new();
        for (name, value) in vars {
            saved.push((*name, std::env::var(name).ok()));
            match value {
                Some(v) => std::env::set_var(name, v),
                None => std::env::remove_var(name),
            }
        }
        Self { saved }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (name, value) in &self.saved {
            match value {
                Some(v) => std::env::set_var(name, v),
                None => std::env::remove_var(name),
            }
        }
    }
}

fn write_credentials(dir: &std::path::Path, doc: serde_json::Value) {
    std::fs::write(
        dir.join("credentials.json"),
        serde_json::to_vec_pretty(&doc).expect("encode credentials"),
    )
    .expect("write credentials");
}

#[test]
fn token_is_loaded_by_canonical_api_url() {
    let _lock = ENV_LOCK.lock().unwrap();
    let dir = create_temp_dir("apptrust_creds");
    let _env = EnvGuard::set(&[
        ("APPTRUST_HOME", Some(dir.to_str().unwrap())),
        ("APPTRUST_TOKEN", None),
        ("JFROG_ACCESS_TOKEN", None),
    ]);

    write_credentials(
        &dir,
        serde_json::json!({
            "schema_version": "apptrust.credentials@0.1.0",
            "tokens": {"https://acme.jfrog.io/apptrust/api/v1/": "from-file"}
        }),
    );

    let got = apptrust_client::load_token("https://acme.jfrog.io/apptrust/api/v1").unwrap();
    assert_eq!(got.as_deref(), Some("from-file"));
    let got = apptrust_client::resolve_token("https://acme.jfrog.io/apptrust/api/v1/").unwrap();
    assert_eq!(got.as_deref(), Some("from-file"));
    let other = apptrust_client::load_token("https://other.jfrog.io/apptrust/api/v1/").unwrap();
    assert_eq!(other, None);

    rm_rf(&dir);
}

#[test]
fn env_token_wins_over_credentials_file() {
    let _lock = ENV_LOCK.lock().unwrap();
    let dir = create_temp_dir("apptrust_creds");
    let _env = EnvGuard::set(&[
        ("APPTRUST_HOME", Some(dir.to_str().unwrap())),
        ("APPTRUST_TOKEN", Some("  ")),
        ("JFROG_ACCESS_TOKEN", Some("from-env")),
    ]);

    write_credentials(
        &dir,
        serde_json::json!({
            "schema_version": "apptrust.credentials@0.1.0",
            "tokens": {"https://acme.jfrog.io/apptrust/api/v1/": "from-file"}
        }),
    );

    let got = apptrust_client::resolve_token("https://acme.jfrog.io/apptrust/api/v1/").unwrap();
    assert_eq!(got.as_deref(), Some("from-env"));

    rm_rf(&dir);
}

#[test]
fn missing_credentials_file_means_no_token() {
    let _lock = ENV_LOCK.lock().unwrap();
    let dir = create_temp_dir("apptrust_creds");
    let _env = EnvGuard::set(&[("APPTRUST_HOME", Some(dir.to_str().unwrap()))]);

    let got = apptrust_client::load_token("https://acme.jfrog.io/apptrust/api/v1/").unwrap();
    assert_eq!(got, None);

    rm_rf(&dir);
}

#[test]
fn credentials_schema_version_is_enforced() {
    let _lock = ENV_LOCK.lock().unwrap();
    let dir = create_temp_dir("apptrust_creds");
    let _env = EnvGuard::set(&[("APPTRUST_HOME", Some(dir.to_str().unwrap()))]);

    write_credentials(
        &dir,
        serde_json::json!({"schema_version": "apptrust.credentials@9.9.9", "tokens": {}}),
    );

    let err = apptrust_client::load_token("https://acme.jfrog.io/apptrust/api/v1/").unwrap_err();
    assert!(
        format!("{err:#}").contains("schema_version mismatch"),
        "got: {err:#}"
    );

    rm_rf(&dir);
}

#[test]
fn api_url_falls_back_to_jfrog_url() {
    let _lock = ENV_LOCK.lock().unwrap();
    let _env = EnvGuard::set(&[
        ("APPTRUST_BASE_URL", None),
        ("JFROG_URL", Some("https://acme.jfrog.io")),
    ]);

    let got = apptrust_client::resolve_api_url(None).unwrap();
    assert_eq!(
        got.as_deref(),
        Some("https://acme.jfrog.io/apptrust/api/v1/")
    );

    let flag = apptrust_client::resolve_api_url(Some("http://127.0.0.1:9/api")).unwrap();
    assert_eq!(flag.as_deref(), Some("http://127.0.0.1:9/api/"));
}

#[test]
fn blank_apptrust_home_falls_back_to_home() {
    let _lock = ENV_LOCK.lock().unwrap();
    let home = create_temp_dir("apptrust_home");
    let _env = EnvGuard::set(&[
        ("APPTRUST_HOME", Some("   ")),
        ("HOME", Some(home.to_str().unwrap())),
    ]);

    let got = apptrust_client::credentials_path().unwrap();
    assert_eq!(got, home.join(".apptrust").join("credentials.json"));

    rm_rf(&home);
}
