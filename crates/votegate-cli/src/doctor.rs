use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use votegate_config::{
    self, ConfigError, ResolvedConfig, ResolvedConfigWithSource, PRIMARY_CONFIG_PATH,
    SECONDARY_CONFIG_PATH,
};
use votegate_core::credentials::PermitSigner;
use votegate_core::faces::extractor::{ENCODER_ENV, LANDMARK_ENV};
use votegate_core::secret_service::{
    ensure_secret_service_available, resolve_embedding_key, resolve_signer_key,
    resolve_token_secret, EmbeddingKeyStore, KeyringEmbeddingKeyStore, KeyringSecretServiceProbe,
    ProcessEnv, SecretServiceProbe, SecretSource, EMBEDDING_KEY_ENV,
};

use crate::errors::AppResult;

const CHECK_CONFIG: &str = "config";
const CHECK_EMBEDDING_DIR: &str = "embedding_store_dir";
const CHECK_AUDIT_LOG: &str = "audit_log";
const CHECK_LANDMARK_MODEL: &str = "landmark_model";
const CHECK_ENCODER_MODEL: &str = "encoder_model";
const CHECK_SECRET_SERVICE: &str = "secret_service";
const CHECK_EMBEDDING_KEY: &str = "embedding_key";
const CHECK_TOKEN_SECRET: &str = "token_secret";
const CHECK_SIGNER_KEY: &str = "signer_key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorCheck {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl DoctorCheck {
    fn new(name: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
            path: None,
        }
    }

    fn at(mut self, path: &Path) -> Self {
        self.path = Some(path.display().to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorOutcome {
    pub ok: bool,
    pub checks: Vec<DoctorCheck>,
}

#[derive(Clone)]
pub struct DoctorPaths {
    pub config_paths: Vec<PathBuf>,
}

impl Default for DoctorPaths {
    fn default() -> Self {
        Self {
            config_paths: vec![
                PathBuf::from(PRIMARY_CONFIG_PATH),
                PathBuf::from(SECONDARY_CONFIG_PATH),
            ],
        }
    }
}

impl DoctorPaths {
    /// `--config` replaces the search list.
    pub fn for_location(location: Option<&Path>) -> Self {
        match location {
            Some(path) => Self {
                config_paths: vec![path.to_path_buf()],
            },
            None => Self::default(),
        }
    }
}

pub struct DoctorContext<E, K, P> {
    pub paths: DoctorPaths,
    pub env: E,
    pub keys: K,
    pub probe: P,
    pub fallback_config: ResolvedConfig,
}

impl DoctorContext<ProcessEnv, KeyringEmbeddingKeyStore, KeyringSecretServiceProbe> {
    pub fn for_location(location: Option<&Path>) -> Self {
        Self {
            paths: DoctorPaths::for_location(location),
            env: ProcessEnv,
            keys: KeyringEmbeddingKeyStore,
            probe: KeyringSecretServiceProbe,
            fallback_config: ResolvedConfig::default(),
        }
    }
}

pub fn run_doctor(location: Option<&Path>) -> AppResult<DoctorOutcome> {
    let ctx = DoctorContext::for_location(location);
    run_doctor_with(&ctx)
}

pub fn run_doctor_with<E, K, P>(ctx: &DoctorContext<E, K, P>) -> AppResult<DoctorOutcome>
where
    E: SecretSource,
    K: EmbeddingKeyStore,
    P: SecretServiceProbe,
{
    let (config_check, resolved) = check_config(&ctx.paths, &ctx.fallback_config);
    let config = &resolved.resolved;

    let mut checks = vec![config_check];
    checks.push(check_embedding_dir(&config.embedding_store_dir));
    checks.push(check_audit_log(&config.audit_log_path));
    checks.push(check_model(
        CHECK_LANDMARK_MODEL,
        config.landmark_model.as_ref(),
        LANDMARK_ENV,
        &ctx.env,
    ));
    checks.push(check_model(
        CHECK_ENCODER_MODEL,
        config.encoder_model.as_ref(),
        ENCODER_ENV,
        &ctx.env,
    ));
    checks.push(check_secret_service(&ctx.env, &ctx.probe));
    checks.push(check_embedding_key(&ctx.env, &ctx.keys));
    checks.push(check_token_secret(&ctx.env));
    checks.push(check_signer_key(&ctx.env));

    let ok = checks.iter().all(|c| c.status != CheckStatus::Fail);

    Ok(DoctorOutcome { ok, checks })
}

fn check_config(
    paths: &DoctorPaths,
    fallback: &ResolvedConfig,
) -> (DoctorCheck, ResolvedConfigWithSource) {
    let defaults = || ResolvedConfigWithSource {
        resolved: fallback.clone(),
        source: None,
    };

    let loaded = votegate_config::load_from_paths(&paths.config_paths);
    match loaded {
        Ok(Some(entry)) => {
            let resolved = ResolvedConfig::from_raw(entry.contents.clone());
            if let Err(ConfigError::Invalid { message, .. }) = resolved.validate(&entry.source) {
                return (
                    DoctorCheck::new(
                        CHECK_CONFIG,
                        CheckStatus::Fail,
                        format!("Invalid config {}: {}", entry.source.display(), message),
                    )
                    .at(&entry.source),
                    defaults(),
                );
            }
            let shadowed = paths
                .config_paths
                .iter()
                .skip_while(|path| **path != entry.source)
                .skip(1)
                .any(|path| path.exists());
            let check = if shadowed {
                DoctorCheck::new(
                    CHECK_CONFIG,
                    CheckStatus::Warn,
                    format!(
                        "Several config files exist; using {}",
                        entry.source.display()
                    ),
                )
            } else {
                DoctorCheck::new(
                    CHECK_CONFIG,
                    CheckStatus::Pass,
                    format!("Loaded config from {}", entry.source.display()),
                )
            };
            (
                check.at(&entry.source),
                ResolvedConfigWithSource {
                    resolved,
                    source: Some(entry.source),
                },
            )
        }
        Ok(None) => (
            DoctorCheck::new(
                CHECK_CONFIG,
                CheckStatus::Warn,
                format!(
                    "No config file found; using built-in defaults (tried {})",
                    display_paths(&paths.config_paths)
                ),
            ),
            defaults(),
        ),
        Err(ConfigError::Parse { path, message }) => (
            DoctorCheck::new(
                CHECK_CONFIG,
                CheckStatus::Fail,
                format!("Failed to parse {}: {}", path.display(), message),
            )
            .at(&path),
            defaults(),
        ),
        Err(ConfigError::Read { path, source }) => (
            DoctorCheck::new(
                CHECK_CONFIG,
                CheckStatus::Fail,
                format!("Failed to read {}: {}", path.display(), source),
            )
            .at(&path),
            defaults(),
        ),
        Err(ConfigError::Invalid { path, message }) => (
            DoctorCheck::new(
                CHECK_CONFIG,
                CheckStatus::Fail,
                format!("Invalid config {}: {}", path.display(), message),
            )
            .at(&path),
            defaults(),
        ),
    }
}

fn check_embedding_dir(path: &Path) -> DoctorCheck {
    match (path.exists(), path.is_dir()) {
        (false, _) => DoctorCheck::new(
            CHECK_EMBEDDING_DIR,
            CheckStatus::Warn,
            format!(
                "Embedding store {} missing; it is created on first enrollment",
                path.display()
            ),
        )
        .at(path),
        (true, false) => DoctorCheck::new(
            CHECK_EMBEDDING_DIR,
            CheckStatus::Fail,
            format!("Embedding store {} is not a directory", path.display()),
        )
        .at(path),
        (true, true) => {
            let readable = fs::read_dir(path).is_ok();
            let writeable = is_writeable_dir(path);
            if readable && writeable {
                DoctorCheck::new(
                    CHECK_EMBEDDING_DIR,
                    CheckStatus::Pass,
                    format!("Embedding store {} is readable/writable", path.display()),
                )
                .at(path)
            } else {
                DoctorCheck::new(
                    CHECK_EMBEDDING_DIR,
                    CheckStatus::Fail,
                    format!(
                        "Embedding store {} lacks {} permissions",
                        path.display(),
                        missing_permissions(readable, writeable)
                    ),
                )
                .at(path)
            }
        }
    }
}

fn check_audit_log(path: &Path) -> DoctorCheck {
    if path.is_dir() {
        return DoctorCheck::new(
            CHECK_AUDIT_LOG,
            CheckStatus::Fail,
            format!("Audit log {} is a directory", path.display()),
        )
        .at(path);
    }

    let parent = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent,
        None => Path::new("."),
    };
    if !parent.is_dir() {
        return DoctorCheck::new(
            CHECK_AUDIT_LOG,
            CheckStatus::Warn,
            format!(
                "Audit directory {} missing; it is created on startup",
                parent.display()
            ),
        )
        .at(path);
    }
    if !is_writeable_dir(parent) {
        return DoctorCheck::new(
            CHECK_AUDIT_LOG,
            CheckStatus::Fail,
            format!("Audit directory {} is not writable", parent.display()),
        )
        .at(path);
    }
    DoctorCheck::new(
        CHECK_AUDIT_LOG,
        CheckStatus::Pass,
        format!("Audit log {} is writable", path.display()),
    )
    .at(path)
}

fn check_model<E: SecretSource>(
    name: &str,
    configured: Option<&PathBuf>,
    env_name: &str,
    env: &E,
) -> DoctorCheck {
    let path = configured
        .cloned()
        .or_else(|| env.var(env_name).map(PathBuf::from));
    match path {
        None => DoctorCheck::new(
            name,
            CheckStatus::Fail,
            format!("Model path not configured; set config or ${env_name}"),
        ),
        Some(p) => match fs::File::open(&p) {
            Ok(_) => DoctorCheck::new(
                name,
                CheckStatus::Pass,
                format!("Found model at {}", p.display()),
            )
            .at(&p),
            Err(err) => DoctorCheck::new(
                name,
                CheckStatus::Fail,
                format!("Cannot read model {}: {}", p.display(), err),
            )
            .at(&p),
        },
    }
}

fn check_secret_service<E, P>(env: &E, probe: &P) -> DoctorCheck
where
    E: SecretSource,
    P: SecretServiceProbe,
{
    match ensure_secret_service_available(probe) {
        Ok(()) => DoctorCheck::new(
            CHECK_SECRET_SERVICE,
            CheckStatus::Pass,
            "Secret Service reachable",
        ),
        // The environment key makes the keyring optional.
        Err(err) if env.var(EMBEDDING_KEY_ENV).is_some() => DoctorCheck::new(
            CHECK_SECRET_SERVICE,
            CheckStatus::Warn,
            format!("Secret Service unavailable ({})", err.message()),
        ),
        Err(err) => DoctorCheck::new(
            CHECK_SECRET_SERVICE,
            CheckStatus::Fail,
            format!(
                "Secret Service unavailable for {}/{}: {}",
                err.service(),
                err.entry(),
                err.message()
            ),
        ),
    }
}

fn check_embedding_key<E, K>(env: &E, keys: &K) -> DoctorCheck
where
    E: SecretSource,
    K: EmbeddingKeyStore,
{
    let source = if env.var(EMBEDDING_KEY_ENV).is_some() {
        format!("${EMBEDDING_KEY_ENV}")
    } else {
        "Secret Service".to_string()
    };
    match resolve_embedding_key(env, keys) {
        Ok(_) => DoctorCheck::new(
            CHECK_EMBEDDING_KEY,
            CheckStatus::Pass,
            format!("Embedding key loaded from {source}"),
        ),
        Err(err) => DoctorCheck::new(CHECK_EMBEDDING_KEY, CheckStatus::Fail, err.human_message()),
    }
}

fn check_token_secret<E: SecretSource>(env: &E) -> DoctorCheck {
    match resolve_token_secret(env) {
        Ok(_) => DoctorCheck::new(CHECK_TOKEN_SECRET, CheckStatus::Pass, "Token secret set"),
        Err(err) => DoctorCheck::new(CHECK_TOKEN_SECRET, CheckStatus::Fail, err.human_message()),
    }
}

fn check_signer_key<E: SecretSource>(env: &E) -> DoctorCheck {
    match resolve_signer_key(env) {
        None => DoctorCheck::new(
            CHECK_SIGNER_KEY,
            CheckStatus::Warn,
            "No signer key; voting permits will not be signed",
        ),
        Some(hex) => match PermitSigner::from_hex(&hex) {
            Ok(signer) => DoctorCheck::new(
                CHECK_SIGNER_KEY,
                CheckStatus::Pass,
                format!("Permit signer {}", signer.checksum_address()),
            ),
            Err(err) => {
                DoctorCheck::new(CHECK_SIGNER_KEY, CheckStatus::Fail, err.human_message())
            }
        },
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn missing_permissions(readable: bool, writeable: bool) -> &'static str {
    match (readable, writeable) {
        (false, false) => "read/write",
        (false, true) => "read",
        _ => "write",
    }
}

fn is_writeable_dir(path: &Path) -> bool {
    if let Ok(metadata) = fs::metadata(path) {
        if metadata.permissions().readonly() {
            return false;
        }
    }

    // Probe with a file that is unlinked on drop.
    tempfile::Builder::new()
        .prefix(".votegate-doctor-")
        .tempfile_in(path)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs::File;
    use tempfile::tempdir;
    use votegate_core::secret_service::{
        EmbeddingKey, EmbeddingKeyLookupError, EmbeddingKeyStatus, SecretServiceError,
        SIGNER_KEY_ENV, TOKEN_SECRET_ENV,
    };

    #[derive(Default)]
    struct StubEnv(HashMap<String, String>);

    impl StubEnv {
        fn set(mut self, name: &str, value: &str) -> Self {
            self.0.insert(name.into(), value.into());
            self
        }
    }

    impl SecretSource for StubEnv {
        fn var(&self, name: &str) -> Option<String> {
            self.0.get(name).cloned()
        }
    }

    struct StubKeys(Option<EmbeddingKey>);

    impl EmbeddingKeyStore for StubKeys {
        fn fetch(&self) -> Result<EmbeddingKeyStatus, EmbeddingKeyLookupError> {
            Ok(match &self.0 {
                Some(key) => EmbeddingKeyStatus::Present(key.clone()),
                None => EmbeddingKeyStatus::Missing,
            })
        }

        fn store(&self, _key: &EmbeddingKey) -> Result<(), SecretServiceError> {
            Ok(())
        }
    }

    struct StubProbe(bool);

    impl SecretServiceProbe for StubProbe {
        fn check(&self) -> Result<(), SecretServiceError> {
            if self.0 {
                Ok(())
            } else {
                Err(SecretServiceError::new("embedding-key", "votegate", "no dbus"))
            }
        }
    }

    fn write_fixtures(tmp: &Path) -> PathBuf {
        fs::create_dir_all(tmp.join("store")).unwrap();
        File::create(tmp.join("landmark.dat")).unwrap();
        File::create(tmp.join("encoder.dat")).unwrap();
        let config = tmp.join("config.toml");
        fs::write(
            &config,
            format!(
                "embedding_store_dir = \"{}\"\naudit_log_path = \"{}\"\nlandmark_model = \"{}\"\nencoder_model = \"{}\"\n",
                tmp.join("store").display(),
                tmp.join("audit.jsonl").display(),
                tmp.join("landmark.dat").display(),
                tmp.join("encoder.dat").display()
            ),
        )
        .unwrap();
        config
    }

    fn complete_env() -> StubEnv {
        StubEnv::default()
            .set(TOKEN_SECRET_ENV, &"t".repeat(48))
            .set(
                SIGNER_KEY_ENV,
                "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318",
            )
    }

    fn doctor_with(config_paths: Vec<PathBuf>, env: StubEnv, keys: StubKeys) -> DoctorOutcome {
        let ctx = DoctorContext {
            paths: DoctorPaths { config_paths },
            env,
            keys,
            probe: StubProbe(true),
            fallback_config: ResolvedConfig::default(),
        };
        run_doctor_with(&ctx).unwrap()
    }

    fn status<'a>(checks: &'a [DoctorCheck], name: &str) -> &'a DoctorCheck {
        checks
            .iter()
            .find(|c| c.name == name)
            .expect("check present")
    }

    #[test]
    fn doctor_success_when_all_checks_pass() {
        let tmp = tempdir().unwrap();
        let config = write_fixtures(tmp.path());

        let outcome = doctor_with(
            vec![config],
            complete_env(),
            StubKeys(Some(EmbeddingKey::generate())),
        );

        assert!(outcome.ok, "statuses: {:?}", outcome.checks);
        assert!(outcome
            .checks
            .iter()
            .all(|check| check.status == CheckStatus::Pass));
        assert!(status(&outcome.checks, CHECK_SIGNER_KEY)
            .message
            .contains("0x2c7536E3605D9C16a7a3D7b1898e529396a65c23"));
    }

    #[test]
    fn missing_config_only_warns() {
        let tmp = tempdir().unwrap();
        let outcome = doctor_with(
            vec![tmp.path().join("absent.toml")],
            complete_env(),
            StubKeys(Some(EmbeddingKey::generate())),
        );
        assert_eq!(
            status(&outcome.checks, CHECK_CONFIG).status,
            CheckStatus::Warn
        );
    }

    #[test]
    fn broken_config_fails() {
        let tmp = tempdir().unwrap();
        let config = tmp.path().join("config.toml");
        fs::write(&config, "similarity_threshold = \"high\"").unwrap();
        let outcome = doctor_with(
            vec![config],
            complete_env(),
            StubKeys(Some(EmbeddingKey::generate())),
        );
        assert_eq!(
            status(&outcome.checks, CHECK_CONFIG).status,
            CheckStatus::Fail
        );
        assert!(!outcome.ok);
    }

    #[test]
    fn missing_secrets_fail_and_missing_signer_warns() {
        let tmp = tempdir().unwrap();
        let config = write_fixtures(tmp.path());
        let outcome = doctor_with(vec![config], StubEnv::default(), StubKeys(None));

        assert!(!outcome.ok);
        assert_eq!(
            status(&outcome.checks, CHECK_EMBEDDING_KEY).status,
            CheckStatus::Fail
        );
        assert_eq!(
            status(&outcome.checks, CHECK_TOKEN_SECRET).status,
            CheckStatus::Fail
        );
        assert_eq!(
            status(&outcome.checks, CHECK_SIGNER_KEY).status,
            CheckStatus::Warn
        );
    }

    #[test]
    fn invalid_signer_key_fails() {
        let tmp = tempdir().unwrap();
        let config = write_fixtures(tmp.path());
        let env = complete_env().set(SIGNER_KEY_ENV, "zz");
        let outcome = doctor_with(vec![config], env, StubKeys(Some(EmbeddingKey::generate())));
        assert_eq!(
            status(&outcome.checks, CHECK_SIGNER_KEY).status,
            CheckStatus::Fail
        );
    }

    #[test]
    fn model_path_falls_back_to_env() {
        let tmp = tempdir().unwrap();
        let model = tmp.path().join("landmark.dat");
        File::create(&model).unwrap();
        let env = StubEnv::default().set(LANDMARK_ENV, &model.display().to_string());

        let check = check_model(CHECK_LANDMARK_MODEL, None, LANDMARK_ENV, &env);
        assert_eq!(check.status, CheckStatus::Pass);

        let missing = check_model(CHECK_ENCODER_MODEL, None, ENCODER_ENV, &env);
        assert_eq!(missing.status, CheckStatus::Fail);
    }

    #[test]
    fn unreachable_secret_service_warns_when_env_key_present() {
        let probe = StubProbe(false);
        let bare = check_secret_service(&StubEnv::default(), &probe);
        assert_eq!(bare.status, CheckStatus::Fail);

        let env = StubEnv::default().set(EMBEDDING_KEY_ENV, &EmbeddingKey::generate().to_base64());
        let covered = check_secret_service(&env, &probe);
        assert_eq!(covered.status, CheckStatus::Warn);
    }

    #[test]
    fn store_path_that_is_a_file_fails() {
        let tmp = tempdir().unwrap();
        let file = tmp.path().join("store");
        File::create(&file).unwrap();
        assert_eq!(check_embedding_dir(&file).status, CheckStatus::Fail);
        assert_eq!(
            check_embedding_dir(&tmp.path().join("absent")).status,
            CheckStatus::Warn
        );
    }
}
