//! CLI subcommands for the NapCatQQ channel.

use std::{io::Write, path::Path, time::Duration};

use {
    anyhow::{Result, anyhow, bail},
    clap::{Args, Subcommand},
    napgate_channels::gating::{DmPolicy, GroupPolicy},
    napgate_config::{ConfigProvider, FileConfigProvider},
    napgate_napcat::{
        config::{default_account_id, disable_all, normalize_account_id, resolve_account},
        logout_account,
        outbound::{SendOptions, get_login_info, send_message},
        plugin::connect_detached,
        setup::{
            self, IssueKind, OnboardingAnswers, SetupInput, TARGET_HINT, apply_onboarding,
            apply_setup, collect_all_warnings, collect_status_issues, onboarding_status,
            parse_target, validate_owner_id, validate_setup_input, validate_ws_url,
        },
    },
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Subcommand)]
pub enum ChannelAction {
    /// Show configured accounts and config problems.
    Status,
    /// Write the NapCat WebSocket address (and token) for an account.
    Setup(SetupArgs),
    /// Interactive setup of one account.
    Onboard {
        #[arg(long)]
        account: Option<String>,
    },
    /// Clear the access token of an account.
    Logout {
        #[arg(long)]
        account: Option<String>,
    },
    /// Print configuration warnings.
    Warnings,
    /// Disable every account.
    Disable,
    /// Connect and report the bot identity.
    Probe {
        #[arg(long)]
        account: Option<String>,
    },
    /// Send one message through a short-lived connection.
    Send(SendArgs),
}

#[derive(Args, Clone)]
pub struct SetupArgs {
    #[arg(long)]
    account: Option<String>,
    /// NapCat forward WebSocket, e.g. ws://127.0.0.1:3001.
    #[arg(long)]
    url: Option<String>,
    /// OneBot access token.
    #[arg(long, env = "NAPCAT_ACCESS_TOKEN")]
    token: Option<String>,
}

#[derive(Args, Clone, Default)]
pub struct SendArgs {
    #[arg(long)]
    account: Option<String>,
    /// `<qq>` or `g<group>`; falls back to the account's `defaultTo`.
    #[arg(long)]
    to: Option<String>,
    #[arg(short, long)]
    text: Option<String>,
    #[arg(long)]
    image: Option<String>,
    #[arg(long)]
    voice: Option<String>,
    #[arg(long)]
    video: Option<String>,
    #[arg(long)]
    reply_to: Option<String>,
}

pub async fn handle_channels(action: ChannelAction, config_path: &Path) -> Result<()> {
    let provider = FileConfigProvider::new(config_path);
    match action {
        ChannelAction::Status => status(&provider),
        ChannelAction::Setup(args) => run_setup(&provider, args),
        ChannelAction::Onboard { account } => onboard(&provider, account.as_deref()),
        ChannelAction::Logout { account } => {
            let account_id = account_id(&provider, account.as_deref())?;
            let result = logout_account(&provider, &account_id)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        },
        ChannelAction::Warnings => {
            let warnings = collect_all_warnings(&provider.load()?);
            if warnings.is_empty() {
                println!("No warnings.");
            }
            for warning in warnings {
                println!("⚠️  {warning}");
            }
            Ok(())
        },
        ChannelAction::Disable => {
            if provider.update(&mut disable_all)? {
                println!("All NapCatQQ accounts disabled.");
            } else {
                println!("Nothing to disable.");
            }
            Ok(())
        },
        ChannelAction::Probe { account } => probe(&provider, account.as_deref()).await,
        ChannelAction::Send(args) => send(&provider, args).await,
    }
}

fn account_id(provider: &dyn ConfigProvider, raw: Option<&str>) -> Result<String> {
    Ok(match raw {
        Some(raw) => normalize_account_id(Some(raw)),
        None => default_account_id(&provider.load()?),
    })
}

fn status(provider: &dyn ConfigProvider) -> Result<()> {
    let cfg = provider.load()?;
    for line in onboarding_status(&cfg) {
        println!("{line}");
    }
    let snapshots: Vec<_> = napgate_napcat::config::list_account_ids(&cfg)
        .iter()
        .map(|id| setup::AccountSnapshot::new(&resolve_account(&cfg, Some(id)), None))
        .collect();
    for issue in collect_status_issues(&snapshots)
        .into_iter()
        .filter(|issue| issue.kind == IssueKind::Config)
    {
        println!("  {}: {}", issue.account_id, issue.message);
        println!("    fix: {}", issue.fix);
    }
    Ok(())
}

fn run_setup(provider: &dyn ConfigProvider, args: SetupArgs) -> Result<()> {
    let account_id = account_id(provider, args.account.as_deref())?;
    let url = required_value(args.url, "NapCat WebSocket URL", "ws://127.0.0.1:3001")?;
    let input = SetupInput {
        url: Some(url),
        token: args.token,
    };
    validate_setup_input(&input).map_err(|e| anyhow!(e))?;
    validate_ws_url(input.url.as_deref().unwrap_or_default()).map_err(|e| anyhow!(e))?;
    let changed = provider.update(&mut |cfg| apply_setup(cfg, &account_id, &input))?;
    if changed {
        println!("NapCatQQ account \"{account_id}\" configured.");
    } else {
        println!("NapCatQQ account \"{account_id}\" already up to date.");
    }
    Ok(())
}

fn onboard(provider: &dyn ConfigProvider, account: Option<&str>) -> Result<()> {
    let account_id = account_id(provider, account)?;
    let current = resolve_account(&provider.load()?, Some(&account_id));
    println!("Setting up NapCatQQ account \"{account_id}\".");

    let ws_default = if current.ws_url.is_empty() {
        "ws://127.0.0.1:3001"
    } else {
        current.ws_url.as_str()
    };
    let ws_url = prompt_validated("NapCat WebSocket URL", Some(ws_default), validate_ws_url)?;
    let access_token = prompt_optional("Access token (empty for none)")?;
    let dm_policy: DmPolicy = prompt_choice("DM policy (pairing/open/closed)", "pairing")?;
    let owner_default = current.owner_ids().into_iter().next();
    let owner_id = prompt_validated(
        "Owner QQ number",
        owner_default.as_deref(),
        validate_owner_id,
    )?;
    let group_policy: GroupPolicy =
        prompt_choice("Group policy (disabled/open/allowlist/pairing)", "disabled")?;
    let require_mention = if group_policy == GroupPolicy::Disabled {
        true
    } else {
        prompt_yes_no("Require @mention in groups?", true)?
    };

    let answers = OnboardingAnswers {
        ws_url,
        access_token,
        dm_policy,
        owner_id,
        group_policy,
        require_mention,
    };
    let mut outcome = Ok(());
    provider.update(&mut |cfg| {
        outcome = apply_onboarding(cfg, &account_id, &answers);
        outcome.is_ok()
    })?;
    outcome.map_err(|e| anyhow!(e))?;

    for line in onboarding_status(&provider.load()?) {
        println!("{line}");
    }
    Ok(())
}

async fn probe(provider: &dyn ConfigProvider, account: Option<&str>) -> Result<()> {
    let account_id = account_id(provider, account)?;
    let account = resolve_account(&provider.load()?, Some(&account_id));
    let client = connect_detached(&account, CONNECT_TIMEOUT).await?;
    let info = get_login_info(client.as_ref()).await;
    client.stop();
    match info {
        Some(info) => {
            let label = if info.nickname.is_empty() {
                info.user_id.as_str()
            } else {
                info.nickname.as_str()
            };
            println!("Bot: {label} ({})", info.user_id);
            Ok(())
        },
        None => bail!("get_login_info failed"),
    }
}

async fn send(provider: &dyn ConfigProvider, args: SendArgs) -> Result<()> {
    let account_id = account_id(provider, args.account.as_deref())?;
    let cfg = provider.load()?;
    let account = resolve_account(&cfg, Some(&account_id));
    let to = args
        .to
        .clone()
        .or_else(|| napgate_napcat::config::resolve_default_to(&cfg, &account_id));
    let opts = send_options(to.as_deref(), &args)?;

    let client = connect_detached(&account, CONNECT_TIMEOUT).await?;
    let result = send_message(client.as_ref(), opts).await;
    client.stop();
    if !result.ok {
        bail!(
            "send failed: {}",
            result.error.unwrap_or_else(|| "unknown error".into())
        );
    }
    match result.message_id {
        Some(id) => println!("Sent (message id {id})."),
        None => println!("Sent."),
    }
    Ok(())
}

fn send_options(to: Option<&str>, args: &SendArgs) -> Result<SendOptions> {
    let Some(raw) = to else {
        bail!("no target given and no defaultTo configured. {TARGET_HINT}");
    };
    let target = parse_target(raw).ok_or_else(|| anyhow!("invalid target \"{raw}\". {TARGET_HINT}"))?;
    let mut opts = SendOptions::to_target(&target.as_target());
    opts.text = args.text.clone().filter(|t| !t.trim().is_empty());
    opts.image_url = args.image.clone();
    opts.voice_url = args.voice.clone();
    opts.video_url = args.video.clone();
    opts.reply_to_message_id = args.reply_to.clone();
    if opts.text.is_none()
        && opts.image_url.is_none()
        && opts.voice_url.is_none()
        && opts.video_url.is_none()
    {
        bail!("nothing to send: pass --text, --image, --voice or --video");
    }
    Ok(opts)
}

fn required_value(provided: Option<String>, prompt: &str, placeholder: &str) -> Result<String> {
    if let Some(value) = provided.filter(|v| !v.trim().is_empty()) {
        return Ok(value.trim().to_string());
    }
    prompt_required(prompt, Some(placeholder))
}

fn read_line(prompt: &str) -> Result<String> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

fn prompt_required(prompt: &str, default: Option<&str>) -> Result<String> {
    let label = match default {
        Some(value) => format!("{prompt} [{value}]: "),
        None => format!("{prompt}: "),
    };
    let input = read_line(&label)?;
    let value = if input.is_empty() {
        default.unwrap_or_default().to_string()
    } else {
        input
    };
    if value.is_empty() {
        return Err(anyhow!("{prompt} is required"));
    }
    Ok(value)
}

fn prompt_optional(prompt: &str) -> Result<Option<String>> {
    let input = read_line(&format!("{prompt}: "))?;
    Ok((!input.is_empty()).then_some(input))
}

fn prompt_validated(
    prompt: &str,
    default: Option<&str>,
    validate: fn(&str) -> std::result::Result<(), String>,
) -> Result<String> {
    loop {
        let value = prompt_required(prompt, default)?;
        match validate(&value) {
            Ok(()) => return Ok(value),
            Err(message) => eprintln!("{message}"),
        }
    }
}

fn prompt_choice<T>(prompt: &str, default: &str) -> Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    loop {
        let value = prompt_required(prompt, Some(default))?;
        match value.parse() {
            Ok(choice) => return Ok(choice),
            Err(message) => eprintln!("{message}"),
        }
    }
}

fn parse_yes_no(input: &str, default_yes: bool) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "" => Some(default_yes),
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

fn prompt_yes_no(prompt: &str, default_yes: bool) -> Result<bool> {
    let suffix = if default_yes { "[Y/n]" } else { "[y/N]" };
    loop {
        let input = read_line(&format!("{prompt} {suffix}: "))?;
        match parse_yes_no(&input, default_yes) {
            Some(answer) => return Ok(answer),
            None => println!("Please answer y or n."),
        }
    }
}
