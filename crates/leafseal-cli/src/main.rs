//! leafseal: encrypt the values of structured documents, leave the keys
//!
//! Commands:
//!   encrypt <file>   - seal every in-scope value under age/box key groups
//!   decrypt <file>   - recover the data key and print the cleartext document
//!   rotate <file>    - re-encrypt under a fresh data key, adding/removing keys
//!   set <file>       - insert or replace one value, keeping the data key
//!   keygen box       - generate a box keypair
//!   config show      - print the active configuration

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use leafseal_core::config::expand_tilde;
use leafseal_core::{LeafsealConfig, RulesConfig};
use leafseal_keys::age::AgeMasterKey;
use leafseal_keys::naclbox::{BoxKeyFile, BoxMasterKey};
use leafseal_keys::{GroupCallOptions, KeyContext, KeyGroup, MasterKey};
use leafseal_stores::{Format, Store};
use leafseal_tree::{
    decrypt_tree, encrypt_tree, extract, needs_rotation, rotate_tree, set_value, DecryptOptions,
    EncryptOptions, Metadata, RotateOptions, Tree, TreePath,
};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "leafseal",
    version,
    about = "Encrypt the values of YAML and JSON documents",
    long_about = "leafseal: per-value encryption for structured documents, with the data key \
                  split across age and box key groups"
)]
struct Cli {
    /// Path to leafseal.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "LEAFSEAL_CONFIG",
        default_value = "~/.config/leafseal/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "LEAFSEAL_LOG")]
    log: Option<String>,

    /// Log format; overrides the config file
    #[arg(long, env = "LEAFSEAL_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt a cleartext document
    Encrypt {
        file: PathBuf,

        /// age recipients (comma-separated, repeatable); all form one key group
        #[arg(long = "age")]
        age: Vec<String>,

        /// box public keys (comma-separated, repeatable); same group as --age
        #[arg(long = "box")]
        box_keys: Vec<String>,

        /// One key group per occurrence: "age:<recipient>,box:<pubkey>,..."
        #[arg(long = "key-group", conflicts_with_all = ["age", "box_keys"])]
        key_groups: Vec<String>,

        /// Keys required inside each group (default: all)
        #[arg(long)]
        group_threshold: Option<usize>,

        /// Key groups required to recover the data key (default: all)
        #[arg(long)]
        shamir_threshold: Option<usize>,

        #[command(flatten)]
        rules: RuleArgs,

        #[command(flatten)]
        io: IoArgs,
    },

    /// Decrypt a document
    Decrypt {
        file: PathBuf,

        /// Print only the value at this path, e.g. '["db"]["password"]'
        #[arg(long)]
        extract: Option<String>,

        /// Decrypt even if the MAC does not verify
        #[arg(long)]
        ignore_mac: bool,

        #[command(flatten)]
        io: IoArgs,
    },

    /// Re-encrypt under a fresh data key
    Rotate {
        file: PathBuf,

        /// age recipients to add to the first key group
        #[arg(long)]
        add_age: Vec<String>,

        /// age recipients to remove from every key group
        #[arg(long)]
        rm_age: Vec<String>,

        /// box public keys to add to the first key group
        #[arg(long)]
        add_box: Vec<String>,

        /// box public keys to remove from every key group
        #[arg(long)]
        rm_box: Vec<String>,

        /// Only rotate when a master key is older than the rotation age
        #[arg(long)]
        if_needed: bool,

        #[arg(long)]
        ignore_mac: bool,

        #[command(flatten)]
        io: IoArgs,
    },

    /// Insert or replace one value in an encrypted document
    ///
    /// Untouched values keep their exact ciphertext. The file is rewritten in
    /// place unless --output is given.
    Set {
        file: PathBuf,

        /// Where to write, e.g. '["db"]["password"]'; the parent must exist
        path: String,

        /// New value as JSON, e.g. '"hunter2"', '5432' or '{"a": [1, 2]}'
        value: String,

        #[arg(long)]
        ignore_mac: bool,

        #[command(flatten)]
        io: IoArgs,
    },

    /// Key generation
    Keygen {
        #[command(subcommand)]
        kind: KeygenKind,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum KeygenKind {
    /// Generate a box keypair and print it as JSON
    Box {
        /// Also store the private key in the configured key directory
        #[arg(long)]
        save: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

/// Matcher overrides; any one given replaces the configured matcher.
#[derive(Args, Debug, Default)]
struct RuleArgs {
    #[arg(long)]
    unencrypted_suffix: Option<String>,
    #[arg(long)]
    encrypted_suffix: Option<String>,
    #[arg(long)]
    unencrypted_regex: Option<String>,
    #[arg(long)]
    encrypted_regex: Option<String>,
    /// Only authenticate encrypted values in the MAC
    #[arg(long)]
    mac_only_encrypted: bool,
}

#[derive(Args, Debug, Default)]
struct IoArgs {
    /// Write to this file instead of stdout (atomic replace)
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,

    /// Overwrite the input file
    #[arg(long, short = 'i', conflicts_with = "output")]
    in_place: bool,

    /// Input format (default: from the file extension)
    #[arg(long)]
    input_type: Option<Format>,

    /// Output format (default: the input format)
    #[arg(long)]
    output_type: Option<Format>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let config = LeafsealConfig::load(&config_path)
        .with_context(|| format!("loading config: {}", config_path.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = match cli.log_format {
        Some(format) => format,
        None if config.log.format == "json" => LogFormat::Json,
        None => LogFormat::Text,
    };
    init_logging(&level, &format);

    let ctx = KeyContext::from_config(&config);

    match cli.command {
        Commands::Encrypt {
            file,
            age,
            box_keys,
            key_groups,
            group_threshold,
            shamir_threshold,
            rules,
            io,
        } => {
            let groups = build_groups(&age, &box_keys, &key_groups, group_threshold, &config, &ctx)?;
            cmd_encrypt(&config, &file, groups, shamir_threshold, rules, &io).await
        }
        Commands::Decrypt {
            file,
            extract,
            ignore_mac,
            io,
        } => cmd_decrypt(&config, &ctx, &file, extract.as_deref(), ignore_mac, &io).await,
        Commands::Rotate {
            file,
            add_age,
            rm_age,
            add_box,
            rm_box,
            if_needed,
            ignore_mac,
            io,
        } => {
            let mut add_keys: Vec<(usize, Box<dyn MasterKey>)> = Vec::new();
            for key in flat_keys(&add_age, &add_box, &ctx)? {
                add_keys.push((0, key));
            }
            let remove_keys = key_ids(&rm_age, &normalize_box_keys(&rm_box));
            let opts = RotateOptions {
                decrypt: decrypt_options(&config, ignore_mac),
                add_keys,
                remove_keys,
            };
            cmd_rotate(&ctx, &file, opts, if_needed, &io).await
        }
        Commands::Set {
            file,
            path,
            value,
            ignore_mac,
            io,
        } => {
            let io = IoArgs {
                in_place: io.output.is_none(),
                ..io
            };
            let opts = decrypt_options(&config, ignore_mac);
            cmd_set(&ctx, &file, &path, &value, opts, &io).await
        }
        Commands::Keygen {
            kind: KeygenKind::Box { save },
        } => cmd_keygen_box(&ctx, save).await,
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries documents; logs go to stderr
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Key groups ────────────────────────────────────────────────────────────────

/// Keys from comma-separated `--age`/`--box` lists.
fn flat_keys(age: &[String], box_keys: &[String], ctx: &KeyContext) -> Result<Vec<Box<dyn MasterKey>>> {
    let mut keys: Vec<Box<dyn MasterKey>> = Vec::new();
    for list in age {
        for key in AgeMasterKey::from_recipients(list, ctx)
            .with_context(|| format!("parsing age recipients {list:?}"))?
        {
            keys.push(Box::new(key));
        }
    }
    for list in box_keys {
        for key in BoxMasterKey::from_public_keys(list, ctx)
            .with_context(|| format!("parsing box public keys {list:?}"))?
        {
            keys.push(Box::new(key));
        }
    }
    Ok(keys)
}

/// Parse one `--key-group` value: `age:<recipient>,box:<pubkey>,...`.
fn parse_key_group(spec: &str, ctx: &KeyContext) -> Result<Vec<Box<dyn MasterKey>>> {
    let mut keys: Vec<Box<dyn MasterKey>> = Vec::new();
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (kind, value) = entry
            .split_once(':')
            .with_context(|| format!("key {entry:?} must be written as <type>:<key>"))?;
        match kind {
            "age" => keys.push(Box::new(AgeMasterKey::new(value, ctx)?)),
            "box" => keys.push(Box::new(BoxMasterKey::new(value, ctx)?)),
            other => bail!("unknown key type {other:?} (expected age or box)"),
        }
    }
    Ok(keys)
}

fn build_groups(
    age: &[String],
    box_keys: &[String],
    key_groups: &[String],
    group_threshold: Option<usize>,
    config: &LeafsealConfig,
    ctx: &KeyContext,
) -> Result<Vec<KeyGroup>> {
    let threshold = group_threshold
        .or(Some(config.keys.group_threshold))
        .filter(|&t| t != 0);

    let mut members = Vec::new();
    if key_groups.is_empty() {
        members.push(flat_keys(age, box_keys, ctx)?);
    } else {
        for spec in key_groups {
            members.push(parse_key_group(spec, ctx)?);
        }
    }
    if members.iter().all(Vec::is_empty) {
        bail!("no master keys given: use --age, --box or --key-group");
    }

    members
        .into_iter()
        .enumerate()
        .map(|(index, keys)| {
            KeyGroup::new(keys, threshold).with_context(|| format!("key group {index}"))
        })
        .collect()
}

/// Normalise box keys the same way [`BoxMasterKey`] prints them.
fn normalize_box_keys(lists: &[String]) -> Vec<String> {
    lists
        .iter()
        .flat_map(|list| list.split(','))
        .map(|k| k.trim().replace(' ', ""))
        .filter(|k| !k.is_empty())
        .collect()
}

fn key_ids(age: &[String], box_keys: &[String]) -> Vec<String> {
    age.iter()
        .flat_map(|list| list.split(','))
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .chain(box_keys.iter().cloned())
        .collect()
}

impl RuleArgs {
    fn apply(self, mut rules: RulesConfig) -> RulesConfig {
        let matchers = [
            self.unencrypted_suffix,
            self.encrypted_suffix,
            self.unencrypted_regex,
            self.encrypted_regex,
        ];
        if matchers.iter().any(Option::is_some) {
            let [unencrypted_suffix, encrypted_suffix, unencrypted_regex, encrypted_regex] =
                matchers.map(Option::unwrap_or_default);
            rules.unencrypted_suffix = unencrypted_suffix;
            rules.encrypted_suffix = encrypted_suffix;
            rules.unencrypted_regex = unencrypted_regex;
            rules.encrypted_regex = encrypted_regex;
        }
        rules.mac_only_encrypted |= self.mac_only_encrypted;
        rules
    }
}

// ── Input / output ────────────────────────────────────────────────────────────

fn formats(io: &IoArgs, file: &Path) -> (Box<dyn Store>, Box<dyn Store>) {
    let input = io.input_type.unwrap_or_else(|| Format::from_path(file));
    let output = io.output_type.unwrap_or(input);
    (input.store(), output.store())
}

async fn read_input(file: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(file)
        .await
        .with_context(|| format!("reading {}", file.display()))
}

async fn write_output(io: &IoArgs, file: &Path, content: &[u8]) -> Result<()> {
    let target = match (&io.output, io.in_place) {
        (Some(path), _) => Some(path.as_path()),
        (None, true) => Some(file),
        (None, false) => None,
    };
    match target {
        Some(path) => atomic_replace(path, content).await,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(content).await?;
            stdout.flush().await?;
            Ok(())
        }
    }
}

/// Write `content` next to `path` and rename it into place.
async fn atomic_replace(path: &Path, content: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let tmp_path = parent.join(format!(
        ".{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy()
    ));

    tokio::fs::write(&tmp_path, content)
        .await
        .with_context(|| format!("writing {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("replacing {}", path.display()))?;

    info!(path = %path.display(), "file written");
    Ok(())
}

fn decrypt_options(config: &LeafsealConfig, ignore_mac: bool) -> DecryptOptions {
    DecryptOptions {
        ignore_mac,
        group: GroupCallOptions::from_config(&config.keys),
        cancel: Some(cancel_on_ctrl_c()),
    }
}

/// A token cancelled when the process receives Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            child.cancel();
        }
    });
    token
}

fn load_encrypted(store: &dyn Store, input: &[u8], file: &Path, ctx: &KeyContext) -> Result<Tree> {
    match store.load_encrypted_file(input, ctx) {
        Ok(tree) => Ok(tree),
        Err(e) if e.is_metadata_not_found() => {
            bail!("{}: file is not encrypted", file.display())
        }
        Err(e) => Err(e).with_context(|| format!("loading {}", file.display())),
    }
}

// ── `leafseal encrypt` ────────────────────────────────────────────────────────

async fn cmd_encrypt(
    config: &LeafsealConfig,
    file: &Path,
    groups: Vec<KeyGroup>,
    shamir_threshold: Option<usize>,
    rules: RuleArgs,
    io: &IoArgs,
) -> Result<()> {
    let (input_store, output_store) = formats(io, file);
    let input = read_input(file).await?;
    let branches = input_store
        .load_plain_file(&input)
        .with_context(|| format!("loading {}", file.display()))?;

    let data_key_threshold = shamir_threshold.or(Some(config.keys.data_key_threshold));
    let metadata = Metadata::new(groups)
        .with_data_key_threshold(data_key_threshold)
        .with_rules(rules.apply(config.rules.clone()));
    let mut tree = Tree::new(branches, metadata);

    let opts = EncryptOptions {
        group: GroupCallOptions::from_config(&config.keys),
        ..Default::default()
    };
    encrypt_tree(&mut tree, opts)
        .await
        .with_context(|| format!("encrypting {}", file.display()))?;

    let out = output_store.emit_encrypted_file(&tree)?;
    write_output(io, file, &out).await
}

// ── `leafseal decrypt` ────────────────────────────────────────────────────────

async fn cmd_decrypt(
    config: &LeafsealConfig,
    ctx: &KeyContext,
    file: &Path,
    extract_path: Option<&str>,
    ignore_mac: bool,
    io: &IoArgs,
) -> Result<()> {
    let (input_store, output_store) = formats(io, file);
    let input = read_input(file).await?;
    let mut tree = load_encrypted(input_store.as_ref(), &input, file, ctx)?;
    let opts = decrypt_options(config, ignore_mac);

    let out = match extract_path {
        Some(raw) => {
            let path = TreePath::parse(raw)?;
            let value = extract(&tree, &path, opts)
                .await
                .with_context(|| format!("extracting {path} from {}", file.display()))?;
            output_store.emit_value(&value)?
        }
        None => {
            decrypt_tree(&mut tree, opts)
                .await
                .with_context(|| format!("decrypting {}", file.display()))?;
            output_store.emit_plain_file(&tree.branches)?
        }
    };
    write_output(io, file, &out).await
}

// ── `leafseal rotate` ─────────────────────────────────────────────────────────

async fn cmd_rotate(
    ctx: &KeyContext,
    file: &Path,
    opts: RotateOptions,
    if_needed: bool,
    io: &IoArgs,
) -> Result<()> {
    let (input_store, output_store) = formats(io, file);
    let input = read_input(file).await?;
    let mut tree = load_encrypted(input_store.as_ref(), &input, file, ctx)?;

    if if_needed && !needs_rotation(&tree) && opts.add_keys.is_empty() && opts.remove_keys.is_empty() {
        info!(file = %file.display(), "no master key needs rotation");
        return Ok(());
    }

    rotate_tree(&mut tree, opts)
        .await
        .with_context(|| format!("rotating {}", file.display()))?;
    let out = output_store.emit_encrypted_file(&tree)?;
    write_output(io, file, &out).await
}

// ── `leafseal set` ────────────────────────────────────────────────────────────

async fn cmd_set(
    ctx: &KeyContext,
    file: &Path,
    raw_path: &str,
    raw_value: &str,
    opts: DecryptOptions,
    io: &IoArgs,
) -> Result<()> {
    let path = TreePath::parse(raw_path)?;
    let value = leafseal_stores::json::parse_value(raw_value)
        .with_context(|| format!("parsing value for {path}"))?;

    let (input_store, output_store) = formats(io, file);
    let input = read_input(file).await?;
    let mut tree = load_encrypted(input_store.as_ref(), &input, file, ctx)?;

    set_value(&mut tree, &path, value, opts)
        .await
        .with_context(|| format!("setting {path} in {}", file.display()))?;
    let out = output_store.emit_encrypted_file(&tree)?;
    write_output(io, file, &out).await
}

// ── `leafseal keygen box` ─────────────────────────────────────────────────────

async fn cmd_keygen_box(ctx: &KeyContext, save: bool) -> Result<()> {
    let key_file = BoxKeyFile::generate();
    if save {
        let path = key_file
            .write_to(&ctx.box_key_dir)
            .await
            .context("saving box private key")?;
        eprintln!("private key written to {}", path.display());
        println!("{}", key_file.public_key);
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(&key_file)?);
    Ok(())
}

// ── `leafseal config show` ────────────────────────────────────────────────────

fn cmd_config_show(config: &LeafsealConfig, path: &Path) -> Result<()> {
    println!("# config: {}", path.display());
    println!("{}", toml::to_string_pretty(config).context("serializing config")?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn box_public() -> String {
        BoxKeyFile::generate().public_key.clone()
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_key_group() {
        let ctx = KeyContext::default();
        let (a, b) = (box_public(), box_public());
        let keys = parse_key_group(&format!("box:{a}, box:{b}"), &ctx).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[1].to_string(), b);

        assert!(parse_key_group("pgp:ABCDEF", &ctx).is_err());
        assert!(parse_key_group("no-type-prefix", &ctx).is_err());
    }

    #[test]
    fn test_build_groups() {
        let ctx = KeyContext::default();
        let config = LeafsealConfig::default();
        let specs = vec![format!("box:{}", box_public()), format!("box:{}", box_public())];
        let groups = build_groups(&[], &[], &specs, None, &config, &ctx).unwrap();
        assert_eq!(groups.len(), 2);

        let flat = vec![format!("{},{}", box_public(), box_public())];
        let groups = build_groups(&[], &flat, &[], Some(1), &config, &ctx).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].threshold(), 1);

        assert!(build_groups(&[], &[], &[], None, &config, &ctx).is_err());
        assert!(build_groups(&[], &flat, &[], Some(3), &config, &ctx).is_err());
    }

    #[test]
    fn test_cli_parses_encrypt() {
        let cli = Cli::try_parse_from([
            "leafseal",
            "encrypt",
            "secrets.yaml",
            "--key-group",
            "box:AAAA",
            "--key-group",
            "box:BBBB",
            "--shamir-threshold",
            "1",
            "--encrypted-regex",
            "^data$",
            "--output-type",
            "json",
        ])
        .unwrap();
        match cli.command {
            Commands::Encrypt {
                key_groups,
                shamir_threshold,
                rules,
                io,
                ..
            } => {
                assert_eq!(key_groups.len(), 2);
                assert_eq!(shamir_threshold, Some(1));
                assert_eq!(rules.encrypted_regex.as_deref(), Some("^data$"));
                assert_eq!(io.output_type, Some(Format::Json));
            }
            other => panic!("unexpected command {other:?}"),
        }

        assert!(Cli::try_parse_from([
            "leafseal", "encrypt", "f.yaml", "--age", "x", "--key-group", "box:y"
        ])
        .is_err());
    }

    #[test]
    fn test_cli_parses_set() {
        let cli = Cli::try_parse_from([
            "leafseal",
            "set",
            "secrets.json",
            r#"["db"]["port"]"#,
            "5433",
        ])
        .unwrap();
        match cli.command {
            Commands::Set {
                file, path, value, io, ..
            } => {
                assert_eq!(file, PathBuf::from("secrets.json"));
                assert_eq!(TreePath::parse(&path).unwrap().to_string(), path);
                assert_eq!(
                    leafseal_stores::json::parse_value(&value).unwrap(),
                    leafseal_tree::TreeValue::from(5433i64)
                );
                assert!(io.output.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_rule_overrides_replace_matcher() {
        let configured = RulesConfig {
            unencrypted_suffix: "_plain".into(),
            ..Default::default()
        };
        let rules = RuleArgs {
            encrypted_regex: Some("^secret".into()),
            ..Default::default()
        }
        .apply(configured.clone());
        assert!(rules.unencrypted_suffix.is_empty());
        assert_eq!(rules.encrypted_regex, "^secret");
        rules.validate().unwrap();

        let untouched = RuleArgs::default().apply(configured.clone());
        assert_eq!(untouched, configured);
    }

    #[test]
    fn test_key_ids_split_lists() {
        let ids = key_ids(&["age1a, age1b".into()], &normalize_box_keys(&["K1,K 2".into()]));
        assert_eq!(ids, ["age1a", "age1b", "K1", "K2"]);
    }

    #[tokio::test]
    async fn test_atomic_replace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.yaml");
        tokio::fs::write(&path, b"old").await.unwrap();

        atomic_replace(&path, b"new").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"new");
        assert!(!dir.path().join(".secrets.yaml.tmp").exists());
    }
}
