use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use welfare_kernel_api::{
    generate_name_key, RegisterUserRequest, SubmitAnswerRequest, WelfareApi,
};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "wk")]
#[command(about = "Welfare recommendation kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./welfare_kernel.sqlite3")]
    db: PathBuf,

    /// Hex-encoded 32-byte key for at-rest name encryption. When omitted a
    /// fresh key is generated per invocation, so stored names stay
    /// unrecoverable afterwards.
    #[arg(long)]
    name_key_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    Survey {
        #[command(subcommand)]
        command: SurveyCommand,
    },
    Recommend {
        #[command(subcommand)]
        command: RecommendCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    Register(UserRegisterArgs),
}

#[derive(Debug, Args)]
struct UserRegisterArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    birth_year: i32,
    #[arg(long)]
    region: String,
}

#[derive(Debug, Subcommand)]
enum SurveyCommand {
    Questions,
    Answer(SurveyAnswerArgs),
}

#[derive(Debug, Args)]
struct SurveyAnswerArgs {
    #[arg(long)]
    user_key: String,
    #[arg(long)]
    question: u8,
    /// Selected option text. Repeat for multi-select questions.
    #[arg(long = "answer")]
    answers: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum RecommendCommand {
    Generate(UserKeyArgs),
    Show(UserKeyArgs),
}

#[derive(Debug, Args)]
struct UserKeyArgs {
    #[arg(long)]
    user_key: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn load_name_key(path: Option<&PathBuf>) -> Result<[u8; 32]> {
    let Some(path) = path else {
        return Ok(generate_name_key());
    };

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read name key file {}", path.display()))?;
    let bytes = hex::decode(text.trim())
        .with_context(|| format!("name key file {} is not valid hex", path.display()))?;
    if bytes.len() != 32 {
        return Err(anyhow!(
            "name key file {} must contain exactly 32 hex-encoded bytes",
            path.display()
        ));
    }

    let mut key = [0_u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let name_key = load_name_key(cli.name_key_file.as_ref())?;
    let api = WelfareApi::new(cli.db, name_key);

    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::User { command } => run_user(command, &api),
        Command::Survey { command } => run_survey(command, &api),
        Command::Recommend { command } => run_recommend(command, &api),
    }
}

fn run_db(command: DbCommand, api: &WelfareApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(
                serde_json::to_value(&report).context("failed to serialize integrity report")?,
            )
        }
    }
}

fn run_user(command: UserCommand, api: &WelfareApi) -> Result<()> {
    match command {
        UserCommand::Register(args) => {
            let registered = api.register_user(RegisterUserRequest {
                name: args.name,
                birth_year: args.birth_year,
                region: args.region,
            })?;
            emit_json(
                serde_json::to_value(&registered)
                    .context("failed to serialize registration result")?,
            )
        }
    }
}

fn run_survey(command: SurveyCommand, api: &WelfareApi) -> Result<()> {
    match command {
        SurveyCommand::Questions => {
            let questions = serde_json::to_value(api.survey_questions())
                .context("failed to serialize survey questions")?;
            emit_json(serde_json::json!({ "questions": questions }))
        }
        SurveyCommand::Answer(args) => {
            let stored = api.submit_answer(SubmitAnswerRequest {
                user_key: args.user_key,
                question_id: args.question,
                values: args.answers,
            })?;
            emit_json(serde_json::to_value(&stored).context("failed to serialize answer result")?)
        }
    }
}

fn run_recommend(command: RecommendCommand, api: &WelfareApi) -> Result<()> {
    match command {
        RecommendCommand::Generate(args) => {
            let report = api.generate(&args.user_key)?;
            emit_json(
                serde_json::to_value(&report).context("failed to serialize evaluation report")?,
            )
        }
        RecommendCommand::Show(args) => {
            let report = api.latest(&args.user_key)?;
            let report = serde_json::to_value(&report)
                .context("failed to serialize stored evaluation report")?;
            emit_json(serde_json::json!({
                "user_key": args.user_key,
                "report": report
            }))
        }
    }
}
