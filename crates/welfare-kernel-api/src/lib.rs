use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use welfare_kernel_core::{
    build_evaluation_report, survey_questions, AnswerSet, EvaluationContext, EvaluationReport,
    QuestionId, SurveyQuestion,
};
use welfare_kernel_store_sqlite::{
    IntegrityReport, SchemaStatus, SqliteStore, UserId, UserRow,
};

pub const API_CONTRACT_VERSION: &str = "api.v1";

const NAME_MAGIC: &[u8] = b"WKNAME1";
const MIN_BIRTH_YEAR: i32 = 1900;
const ANONYMOUS_KEY_BYTES: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterUserRequest {
    pub name: String,
    pub birth_year: i32,
    pub region: String,
}

/// Registration receipt. The anonymous key is the only handle the caller
/// keeps; the plaintext name is never returned or stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterUserResult {
    pub user_id: UserId,
    pub anonymous_key: String,
    pub birth_year: i32,
    pub region: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitAnswerRequest {
    pub user_key: String,
    pub question_id: u8,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitAnswerResult {
    pub user_id: UserId,
    pub question_id: u8,
    pub stored_answer: String,
}

#[derive(Clone)]
pub struct WelfareApi {
    db_path: PathBuf,
    name_key: [u8; 32],
}

impl WelfareApi {
    #[must_use]
    pub fn new(db_path: PathBuf, name_key: [u8; 32]) -> Self {
        Self { db_path, name_key }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Run database health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// Register one survey participant and mint their anonymous key.
    ///
    /// # Errors
    /// Returns an error when validation fails or persistence fails.
    pub fn register_user(&self, input: RegisterUserRequest) -> Result<RegisterUserResult> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(anyhow!("name must not be blank"));
        }
        let region = input.region.trim();
        if region.is_empty() {
            return Err(anyhow!("region must not be blank"));
        }
        let current_year = OffsetDateTime::now_utc().year();
        if input.birth_year < MIN_BIRTH_YEAR || input.birth_year > current_year {
            return Err(anyhow!(
                "birth_year {} is outside the accepted range {MIN_BIRTH_YEAR}..={current_year}",
                input.birth_year
            ));
        }

        let mut store = self.open_store()?;
        store.migrate()?;

        let user = UserRow {
            user_id: UserId::new(),
            anonymous_key: generate_anonymous_key(),
            name_ciphertext: encrypt_name(&self.name_key, name)?,
            birth_year: input.birth_year,
            region: region.to_string(),
            created_at: OffsetDateTime::now_utc(),
        };
        store.create_user(&user)?;

        Ok(RegisterUserResult {
            user_id: user.user_id,
            anonymous_key: user.anonymous_key,
            birth_year: user.birth_year,
            region: user.region,
            created_at: user.created_at,
        })
    }

    /// The fixed survey schema, in presentation order.
    #[must_use]
    pub fn survey_questions(&self) -> &'static [SurveyQuestion] {
        survey_questions()
    }

    /// Store one answer, replacing any previous answer to the same question.
    ///
    /// # Errors
    /// Returns an error when the user or question is unknown, the submitted
    /// values are empty, or persistence fails.
    pub fn submit_answer(&self, input: SubmitAnswerRequest) -> Result<SubmitAnswerResult> {
        let question = QuestionId::new(input.question_id)?;
        let stored_answer = canonicalize_answer(&input.values)?;

        let mut store = self.open_store()?;
        store.migrate()?;
        let user = require_user(&store, &input.user_key)?;
        store.upsert_answer(user.user_id, question, &stored_answer)?;

        Ok(SubmitAnswerResult {
            user_id: user.user_id,
            question_id: input.question_id,
            stored_answer,
        })
    }

    /// Evaluate the rule tables against a user's stored answers and persist
    /// the resulting report.
    ///
    /// # Errors
    /// Returns an error when the user is unknown, stored answers cannot be
    /// decoded, or persistence fails.
    pub fn generate(&self, user_key: &str) -> Result<EvaluationReport> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let user = require_user(&store, user_key)?;

        let raw_answers = store.list_answers(user.user_id)?;
        let answers = AnswerSet::from_raw_pairs(
            raw_answers.iter().map(|(question, answer)| (*question, answer.as_str())),
        )?;

        let generated_at = OffsetDateTime::now_utc();
        let context = EvaluationContext {
            age: generated_at.year() - user.birth_year,
            region: user.region.clone(),
            answers,
        };
        let evaluation_id = compute_evaluation_id(user.user_id, generated_at, &raw_answers);
        let report = build_evaluation_report(&context, &evaluation_id, generated_at)?;
        store.save_evaluation(user.user_id, &report)?;
        Ok(report)
    }

    /// Fetch the most recent stored report for a user, if any.
    ///
    /// # Errors
    /// Returns an error when the user is unknown or the lookup fails.
    pub fn latest(&self, user_key: &str) -> Result<Option<EvaluationReport>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let user = require_user(&store, user_key)?;
        store.latest_evaluation(user.user_id)
    }
}

fn require_user(store: &SqliteStore, user_key: &str) -> Result<UserRow> {
    store
        .find_user_by_key(user_key)?
        .ok_or_else(|| anyhow!("unknown user key: {user_key}"))
}

/// Generate a fresh name-encryption key from the OS RNG.
#[must_use]
pub fn generate_name_key() -> [u8; 32] {
    let mut key = [0_u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

fn generate_anonymous_key() -> String {
    let mut bytes = [0_u8; ANONYMOUS_KEY_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Encrypt a display name for at-rest storage. Output is hex over
/// magic header, 24-byte nonce, and ciphertext.
///
/// # Errors
/// Returns an error when encryption fails.
pub fn encrypt_name(key: &[u8; 32], name: &str) -> Result<String> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce_bytes = [0_u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce_bytes), name.as_bytes())
        .map_err(|err| anyhow!("failed to encrypt name: {err}"))?;

    let mut out = Vec::with_capacity(NAME_MAGIC.len() + nonce_bytes.len() + ciphertext.len());
    out.extend_from_slice(NAME_MAGIC);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(hex::encode(out))
}

/// Decrypt a stored name ciphertext produced by [`encrypt_name`].
///
/// # Errors
/// Returns an error when the payload is malformed or the key does not match.
pub fn decrypt_name(key: &[u8; 32], ciphertext_hex: &str) -> Result<String> {
    let encrypted = hex::decode(ciphertext_hex).context("name ciphertext is not valid hex")?;
    if encrypted.len() <= NAME_MAGIC.len() + 24 {
        return Err(anyhow!("name ciphertext is too short"));
    }
    if !encrypted.starts_with(NAME_MAGIC) {
        return Err(anyhow!("name ciphertext is missing expected header"));
    }

    let nonce_start = NAME_MAGIC.len();
    let nonce_end = nonce_start + 24;
    let nonce = XNonce::from_slice(&encrypted[nonce_start..nonce_end]);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let plaintext = cipher
        .decrypt(nonce, &encrypted[nonce_end..])
        .map_err(|err| anyhow!("failed to decrypt name: {err}"))?;
    String::from_utf8(plaintext).context("decrypted name is not valid UTF-8")
}

/// Collapse submitted form values into the stored wire text: a single value
/// is stored verbatim, multiple values become one compact JSON array.
fn canonicalize_answer(values: &[String]) -> Result<String> {
    let trimmed = values
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .collect::<Vec<_>>();

    match trimmed.as_slice() {
        [] => Err(anyhow!("at least one non-blank answer value is required")),
        [single] => Ok((*single).to_string()),
        many => serde_json::to_string(many).context("failed to encode multi-value answer"),
    }
}

fn compute_evaluation_id(
    user_id: UserId,
    generated_at: OffsetDateTime,
    raw_answers: &[(u8, String)],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.to_string().as_bytes());
    hasher.update(generated_at.unix_timestamp().to_string().as_bytes());
    for (question, answer) in raw_answers {
        hasher.update([*question]);
        hasher.update(answer.as_bytes());
    }

    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    format!("eval_{}", &digest_hex[..16])
}
