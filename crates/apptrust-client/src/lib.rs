use std::collections::BTreeMap;
use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

pub const DEFAULT_LIST_LIMIT: u32 = 1000;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const CREDENTIALS_SCHEMA_VERSION: &str = "apptrust.credentials@0.1.0";
const API_SUFFIX: &str = "apptrust/api/v1/";
// `jf curl` takes a server-relative path; the host comes from the jf server context.
const JF_API_ROOT: &str = "http://jf.invalid/apptrust/api/v1/";

/// One application version as the registry reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct VersionRecord {
    #[serde(default)]
    pub version: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tag: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub release_status: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub properties: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct VersionsPage {
    #[serde(default, deserialize_with = "null_as_default")]
    versions: Vec<VersionRecord>,
}

fn null_as_default<'de, D, T>(de: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(de)?.unwrap_or_default())
}

/// Partial update of an application version.
///
/// Omitted members are left untouched by the registry. Each entry in `properties`
/// replaces the whole value list of that key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VersionPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, Vec<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_properties: Option<Vec<String>>,
}

impl VersionPatch {
    pub fn tag_only(tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            ..Self::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.properties
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), values);
        self
    }

    pub fn delete_property(mut self, key: impl Into<String>) -> Self {
        self.delete_properties
            .get_or_insert_with(Vec::new)
            .push(key.into());
        self
    }

    /// Applies the patch the way the registry does: property writes, then deletes, then the tag.
    pub fn apply_to(&self, record: &mut VersionRecord) {
        if let Some(props) = &self.properties {
            for (key, values) in props {
                record.properties.insert(key.clone(), values.clone());
            }
        }
        if let Some(keys) = &self.delete_properties {
            for key in keys {
                record.properties.remove(key);
            }
        }
        if let Some(tag) = &self.tag {
            record.tag = tag.clone();
        }
    }
}

/// The two registry operations the rollback flow depends on.
pub trait RegistryClient {
    /// Every version of `app_key`, unfiltered and in no particular order.
    fn list_versions(&self, app_key: &str) -> Result<Vec<VersionRecord>>;

    /// Sends `patch` for one version as a single request.
    fn patch_version(&self, app_key: &str, version: &str, patch: &VersionPatch) -> Result<()>;
}

/// Talks to the AppTrust REST API directly with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpRegistryClient {
    api_root: Url,
    token: Option<String>,
    timeout: Duration,
    list_limit: u32,
}

impl HttpRegistryClient {
    pub fn new(api_url: &str, token: Option<String>) -> Result<Self> {
        let api_root = Url::parse(&canonical_api_url(api_url)?)
            .with_context(|| format!("invalid api url: {api_url:?}"))?;
        Ok(Self {
            api_root,
            token: token.filter(|t| !t.trim().is_empty()),
            timeout: DEFAULT_TIMEOUT,
            list_limit: DEFAULT_LIST_LIMIT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_list_limit(mut self, limit: u32) -> Self {
        self.list_limit = limit;
        self
    }

    pub fn api_root(&self) -> &Url {
        &self.api_root
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }
}

impl RegistryClient for HttpRegistryClient {
    fn list_versions(&self, app_key: &str) -> Result<Vec<VersionRecord>> {
        let url = versions_url(&self.api_root, app_key, self.list_limit)?;
        let bytes = http_send("GET", &url, self.token.as_deref(), None, self.timeout)?;
        parse_versions_page(&bytes).with_context(|| format!("parse versions of {app_key:?}"))
    }

    fn patch_version(&self, app_key: &str, version: &str, patch: &VersionPatch) -> Result<()> {
        let url = version_url(&self.api_root, app_key, version)?;
        let body = serde_json::to_vec(patch).context("encode patch body")?;
        http_send("PATCH", &url, self.token.as_deref(), Some(&body), self.timeout)?;
        Ok(())
    }
}

/// Goes through `jf curl`, reusing whatever server context (OIDC or token) jf is configured with.
#[derive(Debug, Clone)]
pub struct JfCliRegistryClient {
    jf_bin: PathBuf,
    list_limit: u32,
}

impl JfCliRegistryClient {
    /// Resolves the `jf` executable (`APPTRUST_JF_BIN`, else `jf` on `PATH`).
    pub fn from_env() -> Result<Self> {
        let name = env_nonblank("APPTRUST_JF_BIN").unwrap_or_else(|| "jf".to_string());
        let Some(jf_bin) = find_executable(&name) else {
            anyhow::bail!(
                "JFrog CLI ({name}) not found on PATH; install it and configure a server context for OIDC"
            );
        };
        Ok(Self::new(jf_bin))
    }

    pub fn new(jf_bin: PathBuf) -> Self {
        Self {
            jf_bin,
            list_limit: DEFAULT_LIST_LIMIT,
        }
    }

    pub fn jf_bin(&self) -> &Path {
        &self.jf_bin
    }

    fn run(&self, method: &str, url: &Url, body: Option<&[u8]>) -> Result<Vec<u8>> {
        let path = &url[url::Position::BeforePath..];
        let mut cmd = Command::new(&self.jf_bin);
        cmd.args(["curl", "-X", method, path]);
        if let Some(body) = body {
            let body = std::str::from_utf8(body).context("patch body is not utf-8")?;
            cmd.args(["-H", "Content-Type: application/json", "-d", body]);
        }
        let out = cmd
            .output()
            .with_context(|| format!("spawn {} curl", self.jf_bin.display()))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            anyhow::bail!(
                "jf curl {method} {path} failed ({}): {}",
                out.status,
                stderr.trim()
            );
        }
        Ok(out.stdout)
    }
}

impl RegistryClient for JfCliRegistryClient {
    fn list_versions(&self, app_key: &str) -> Result<Vec<VersionRecord>> {
        let url = versions_url(&jf_api_root()?, app_key, self.list_limit)?;
        let bytes = self.run("GET", &url, None)?;
        parse_versions_page(&bytes).with_context(|| format!("parse versions of {app_key:?}"))
    }

    fn patch_version(&self, app_key: &str, version: &str, patch: &VersionPatch) -> Result<()> {
        let url = version_url(&jf_api_root()?, app_key, version)?;
        let body = serde_json::to_vec(patch).context("encode patch body")?;
        self.run("PATCH", &url, Some(&body))?;
        Ok(())
    }
}

fn jf_api_root() -> Result<Url> {
    Url::parse(JF_API_ROOT).context("parse jf api root")
}

/// Normalizes an API base URL to `http(s)://.../` with a trailing slash.
pub fn canonical_api_url(api_url: &str) -> Result<String> {
    let raw = api_url.trim();
    let url = Url::parse(raw).with_context(|| format!("invalid api url: {api_url:?}"))?;
    match url.scheme() {
        "http" | "https" => {}
        other => anyhow::bail!("unsupported url scheme {other:?} for {}", url.as_str()),
    }
    let mut out = url.as_str().to_string();
    if !out.ends_with('/') {
        out.push('/');
    }
    Ok(out)
}

/// `--base-url`, else `APPTRUST_BASE_URL`, else `JFROG_URL` joined with the AppTrust API path.
pub fn resolve_api_url(flag: Option<&str>) -> Result<Option<String>> {
    if let Some(raw) = flag.map(str::trim).filter(|s| !s.is_empty()) {
        return canonical_api_url(raw).map(Some);
    }
    if let Some(raw) = env_nonblank("APPTRUST_BASE_URL") {
        return canonical_api_url(&raw).map(Some);
    }
    if let Some(raw) = env_nonblank("JFROG_URL") {
        let base = canonical_api_url(&raw)?;
        return Ok(Some(format!("{base}{API_SUFFIX}")));
    }
    Ok(None)
}

/// `APPTRUST_TOKEN`, else `JFROG_ACCESS_TOKEN`, else the credentials file entry for `api_url`.
pub fn resolve_token(api_url: &str) -> Result<Option<String>> {
    for var in ["APPTRUST_TOKEN", "JFROG_ACCESS_TOKEN"] {
        if let Some(token) = env_nonblank(var) {
            return Ok(Some(token));
        }
    }
    load_token(api_url)
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
struct CredentialsFile {
    schema_version: String,
    #[serde(default)]
    tokens: BTreeMap<String, String>,
}

pub fn credentials_path() -> Result<PathBuf> {
    if let Some(dir) = env_nonblank("APPTRUST_HOME") {
        return Ok(PathBuf::from(dir).join("credentials.json"));
    }

    if let Ok(home) = std::env::var("HOME") {
        return Ok(PathBuf::from(home).join(".apptrust").join("credentials.json"));
    }
    if let Ok(home) = std::env::var("USERPROFILE") {
        return Ok(PathBuf::from(home).join(".apptrust").join("credentials.json"));
    }

    anyhow::bail!("missing HOME/USERPROFILE; set APPTRUST_HOME to locate credentials")
}

pub fn load_token(api_url: &str) -> Result<Option<String>> {
    let key = canonical_api_url(api_url)?;
    let path = credentials_path()?;
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let creds: CredentialsFile =
        serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;
    if creds.schema_version.trim() != CREDENTIALS_SCHEMA_VERSION {
        anyhow::bail!(
            "credentials schema_version mismatch: expected {CREDENTIALS_SCHEMA_VERSION} got {:?} ({})",
            creds.schema_version,
            path.display()
        );
    }
    Ok(creds
        .tokens
        .get(&key)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty()))
}

fn http_send(
    method: &str,
    url: &Url,
    token: Option<&str>,
    body: Option<&[u8]>,
    timeout: Duration,
) -> Result<Vec<u8>> {
    match url.scheme() {
        "http" | "https" => {}
        other => anyhow::bail!("unsupported url scheme {other:?} for {}", url.as_str()),
    }
    let auth = token.map(|t| format!("Bearer {t}"));
    let result = match body {
        None => {
            let mut req = ureq::get(url.as_str()).header("Accept", "application/json");
            if let Some(auth) = &auth {
                req = req.header("Authorization", auth);
            }
            req.config()
                .timeout_global(Some(timeout))
                .http_status_as_error(false)
                .build()
                .call()
        }
        Some(body) => {
            let mut req = ureq::patch(url.as_str())
                .header("Accept", "application/json")
                .header("Content-Type", "application/json");
            if let Some(auth) = &auth {
                req = req.header("Authorization", auth);
            }
            req.config()
                .timeout_global(Some(timeout))
                .http_status_as_error(false)
                .build()
                .send(body)
        }
    };
    let resp = result.map_err(|e| anyhow::anyhow!("network error for {method} {url}: {e}"))?;

    let status = resp.status();
    let mut reader = resp.into_body().into_reader();
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .with_context(|| format!("read http response for {method} {url}"))?;
    if !status.is_success() {
        let code: u16 = status.into();
        anyhow::bail!(
            "HTTP {code} {} for {method} {url}: {}",
            status.canonical_reason().unwrap_or(""),
            String::from_utf8_lossy(&buf).trim()
        );
    }
    Ok(buf)
}

fn versions_url(api_root: &Url, app_key: &str, limit: u32) -> Result<Url> {
    let mut url = api_root.clone();
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("api url cannot be a base: {}", api_root.as_str()))?
        .pop_if_empty()
        .extend(["applications", app_key, "versions"]);
    url.query_pairs_mut()
        .append_pair("limit", &limit.to_string())
        .append_pair("order_by", "created")
        .append_pair("order_asc", "false");
    Ok(url)
}

fn version_url(api_root: &Url, app_key: &str, version: &str) -> Result<Url> {
    let mut url = api_root.clone();
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("api url cannot be a base: {}", api_root.as_str()))?
        .pop_if_empty()
        .extend(["applications", app_key, "versions", version]);
    Ok(url)
}

fn parse_versions_page(bytes: &[u8]) -> Result<Vec<VersionRecord>> {
    let text = std::str::from_utf8(bytes).context("versions response is not utf-8")?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let page: VersionsPage = serde_json::from_str(text).context("decode versions response")?;
    Ok(page.versions)
}

fn env_nonblank(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn find_executable(name: &str) -> Option<PathBuf> {
    let direct = PathBuf::from(name);
    if direct.components().count() > 1 {
        return direct.is_file().then_some(direct);
    }
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let cand = dir.join(name);
        if cand.is_file() {
            return Some(cand);
        }
        if !std::env::consts::EXE_SUFFIX.is_empty() {
            let cand = dir.join(format!("{name}{}", std::env::consts::EXE_SUFFIX));
            if cand.is_file() {
                return Some(cand);
            }
        }
    }
    None
}
