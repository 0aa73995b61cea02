// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use kable::{
    concept::{
        get_concept, init_concept, list_concepts, resolve_concept, ConceptIdentifier,
        ConceptInputs, ConceptType, InputKind, InputType,
    },
    config::KableConfig,
    git::{Git2Cache, GitError},
    path::default_config_file,
    registry::{add_repository, remove_repository, store::AnyStore, store_repo_auth, AuthPair},
    render::{
        evaluate::JsonnetCommand,
        is_valid_render_name, render_concept,
        target::TargetType,
        values::{RenderValue, RenderValues},
        RenderError, RenderInfo, RenderOpts,
    },
    repository::RepositoryError,
    Registry, Repository, RepositoryResolver,
};

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use inquire::{Confirm, CustomType, Password, Select, Text};
use std::{path::PathBuf, process::exit, sync::Arc};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "kable [options] <kable-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true, env = "KABLE_CONFIG", value_name = "path")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let config_path = match self.config {
            Some(path) => path,
            None => default_config_file()?,
        };
        let config = KableConfig::load(config_path)?;

        match self.command {
            Command::Add(opts) => run_add(&config, opts),
            Command::Remove(opts) => run_remove(&config, opts),
            Command::List(opts) => run_list(&config, opts),
            Command::Render(opts) => run_render(&config, opts),
            Command::Update => run_update(&config).await,
            Command::Tidy => run_tidy(&config),
            Command::Init(opts) => run_init(opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Register concept repository.
    #[command(override_usage = "kable add [options] <name> <url>")]
    Add(AddOptions),

    /// Unregister concept repositories.
    #[command(override_usage = "kable remove <name>...")]
    Remove(RemoveOptions),

    /// List registered repositories or their concepts.
    #[command(override_usage = "kable list [options]")]
    List(ListOptions),

    /// Render concept into manifests.
    #[command(override_usage = "kable render [options] <concept_id|path>")]
    Render(RenderOptions),

    /// Pull latest changes of every registered repository.
    Update,

    /// Remove cached repositories that are no longer registered.
    Tidy,

    /// Scaffold new jsonnet concept.
    #[command(override_usage = "kable init [options] <dir>")]
    Init(InitOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct AddOptions {
    /// Name of repository, lowercase letters and '-' only.
    #[arg(required = true, value_name = "name")]
    pub name: String,

    /// URL of git remote.
    #[arg(required = true, value_name = "url")]
    pub url: String,

    /// Branch or ref to track instead of master.
    #[arg(short = 'r', long = "ref", value_name = "ref")]
    pub git_ref: Option<String>,

    /// Replace repository of the same name.
    #[arg(short, long)]
    pub force: bool,

    /// Username for basic authentication, prompts for the password.
    #[arg(short, long, value_name = "username")]
    pub username: Option<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RemoveOptions {
    /// Names of repositories to remove.
    #[arg(required = true, value_name = "name")]
    pub names: Vec<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ListOptions {
    /// List concepts of all repositories instead.
    #[arg(long)]
    pub concepts: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RenderOptions {
    /// Concept identifier, or concept directory with --local.
    #[arg(required = true, value_name = "concept_id|path")]
    pub source: String,

    /// Render concept from a local directory.
    #[arg(short, long)]
    pub local: bool,

    /// Collapse all manifests into manifest.yaml.
    #[arg(short, long)]
    pub single: bool,

    /// Output format.
    #[arg(short, long, default_value = "yaml", value_name = "target")]
    pub target: String,

    /// Directory to write rendered files to.
    #[arg(short, long, default_value = "out", value_name = "dir")]
    pub output: PathBuf,

    /// Input value as name=value, maps are given as JSON.
    #[arg(long = "set", value_name = "name=value")]
    pub set: Vec<String>,

    /// Reuse values of an existing render info file.
    #[arg(long, value_name = "renderinfo")]
    pub values: Option<PathBuf>,

    /// Do not write renderinfo.json.
    #[arg(long)]
    pub no_render_info: bool,

    /// Print rendered files instead of writing them.
    #[arg(short, long)]
    pub print: bool,

    /// Fail on missing inputs instead of asking for them.
    #[arg(long)]
    pub no_prompt: bool,

    /// Jsonnet executable to evaluate concepts with.
    #[arg(long, env = "KABLE_JSONNET", default_value = "jsonnet", value_name = "program")]
    pub jsonnet: String,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct InitOptions {
    /// Directory to scaffold concept in.
    #[arg(required = true, value_name = "dir")]
    pub dir: PathBuf,

    /// Name of concept, defaults to the directory name.
    #[arg(short, long, value_name = "name")]
    pub name: Option<String>,
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run() -> Result<()> {
    Cli::parse().run().await
}

fn resolver(config: &KableConfig, git: Git2Cache) -> Result<RepositoryResolver> {
    let store = AnyStore::from_config(&config.store)?;
    Ok(RepositoryResolver::new(
        Registry::new(store),
        git,
        config.resolved_cache_dir()?,
    ))
}

fn run_add(config: &KableConfig, opts: AddOptions) -> Result<()> {
    let resolver = resolver(config, Git2Cache::new().with_progress())?;
    let mut repository = Repository::new(&opts.name, &opts.url);
    if let Some(git_ref) = &opts.git_ref {
        repository = repository.with_ref(git_ref);
    }

    // INVARIANT: Reject malformed names and URLs before touching the network.
    let add = add_repository(repository.clone(), opts.force)?;
    if !opts.force && resolver.registry().read()?.repositories.contains_key(&opts.name) {
        bail!("repository {:?} is already configured, use --force to replace it", opts.name);
    }

    let mut auth = match opts.username {
        Some(username) => Some(AuthPair::new(username, prompt_password()?)),
        None => None,
    };

    match resolver.checkout(&repository, auth.as_ref()) {
        Ok(_) => {}
        Err(RepositoryError::Git(GitError::Authentication { url, .. })) => {
            warn!("authentication required at {url}");
            let pair = AuthPair::new(Text::new("username").prompt()?, prompt_password()?);
            resolver.checkout(&repository, Some(&pair))?;
            auth = Some(pair);
        }
        Err(err) => return Err(err.into()),
    }

    let mut modifications = vec![add];
    if let Some(pair) = &auth {
        modifications.push(store_repo_auth(&repository.url, pair)?);
    }
    resolver.registry().update(modifications)?;
    info!("added repository {:?} tracking {}", repository.name, repository.git_ref);

    Ok(())
}

fn prompt_password() -> Result<String> {
    Ok(Password::new("password").without_confirmation().prompt()?)
}

fn run_remove(config: &KableConfig, opts: RemoveOptions) -> Result<()> {
    let resolver = resolver(config, Git2Cache::new())?;
    let modifications = opts
        .names
        .iter()
        .map(remove_repository)
        .collect::<Result<Vec<_>, _>>()?;
    resolver.registry().update(modifications)?;
    info!("removed {}", opts.names.join(", "));

    Ok(())
}

fn run_list(config: &KableConfig, opts: ListOptions) -> Result<()> {
    let resolver = resolver(config, Git2Cache::new().with_progress())?;
    if opts.concepts {
        for identifier in list_concepts(&resolver)? {
            println!("{identifier}");
        }
        return Ok(());
    }

    for status in resolver.list_repositories()? {
        let state = if status.initialized { "cached" } else { "not cached" };
        println!(
            "{:<20} {} ({}, {state})",
            status.repository.name, status.repository.url, status.repository.git_ref
        );
    }

    Ok(())
}

fn run_render(config: &KableConfig, opts: RenderOptions) -> Result<()> {
    let resolver = resolver(config, Git2Cache::new().with_progress())?;
    let evaluator = JsonnetCommand::new(&opts.jsonnet);
    let target: TargetType = opts.target.parse()?;

    let concept = if opts.local {
        get_concept(&opts.source)?
    } else {
        let identifier: ConceptIdentifier = opts.source.parse()?;
        resolve_concept(&resolver, &identifier)?.concept
    };

    let mut values = match &opts.values {
        Some(path) => RenderInfo::from_file(path, &concept.inputs)?.values,
        None => RenderValues::new(),
    };
    for set in &opts.set {
        let (name, raw) = set
            .split_once('=')
            .ok_or_else(|| anyhow!("expected name=value, got {set:?}"))?;
        let input = concept
            .inputs
            .get(name)
            .ok_or_else(|| RenderError::UndeclaredInput(name.to_string()))?;
        values.insert(name, RenderValue::parse(name, raw, input)?);
    }
    if !opts.no_prompt {
        prompt_missing(&mut values, &concept.inputs)?;
    }

    let render_opts = RenderOpts {
        local: opts.local,
        write_render_info: !opts.no_render_info && opts.values.is_none(),
        single: opts.single,
    };
    let render = render_concept(&resolver, &evaluator, &opts.source, values, target, render_opts)?;

    if opts.print {
        print!("{}", render.print_files());
    } else {
        render.write(&opts.output)?;
    }

    Ok(())
}

fn prompt_missing(values: &mut RenderValues, inputs: &ConceptInputs) -> Result<()> {
    let missing = values
        .missing(inputs)
        .map(|(name, input, mandatory)| (name.clone(), input.clone(), mandatory))
        .collect::<Vec<_>>();

    for (name, input, mandatory) in missing {
        if let Some(value) = prompt_value(&name, &input, mandatory)? {
            values.insert(name, value);
        }
    }

    Ok(())
}

fn prompt_value(name: &str, input: &InputType, mandatory: bool) -> Result<Option<RenderValue>> {
    let value = match input.kind {
        InputKind::String => Text::new(name).prompt_skippable()?.map(RenderValue::String),
        InputKind::Select => Select::new(name, input.options.clone())
            .prompt_skippable()?
            .map(RenderValue::String),
        InputKind::Int => CustomType::<i64>::new(name)
            .prompt_skippable()?
            .map(RenderValue::Int),
        InputKind::Bool => Confirm::new(name).prompt_skippable()?.map(RenderValue::Bool),
        InputKind::Map => match Text::new(name)
            .with_help_message("JSON object")
            .prompt_skippable()?
        {
            Some(raw) => Some(RenderValue::parse(name, &raw, input)?),
            None => None,
        },
    };

    if mandatory && value.is_none() {
        return Err(RenderError::MissingMandatoryInput(name.to_string()).into());
    }

    Ok(value)
}

async fn run_update(config: &KableConfig) -> Result<()> {
    let resolver = Arc::new(resolver(config, Git2Cache::new())?);
    let names = resolver
        .registry()
        .list_repositories()?
        .into_iter()
        .map(|repository| repository.name)
        .collect::<Vec<_>>();

    let tasks = names.into_iter().map(|name| {
        let resolver = Arc::clone(&resolver);
        tokio::task::spawn_blocking(move || {
            let outcome = resolver.update_repository(&name);
            (name, outcome)
        })
    });

    let mut failed = Vec::new();
    for result in futures::future::join_all(tasks).await {
        let (name, outcome) = result?;
        match outcome {
            Ok(outcome) => info!("{name}: {outcome:?}"),
            Err(err) => {
                error!("{name}: {:?}", anyhow::Error::from(err));
                failed.push(name);
            }
        }
    }

    if !failed.is_empty() {
        bail!("failed to update {}", failed.join(", "));
    }

    Ok(())
}

fn run_tidy(config: &KableConfig) -> Result<()> {
    let resolver = resolver(config, Git2Cache::new())?;
    let removed = resolver.tidy_cache()?;
    if removed.is_empty() {
        info!("cache is tidy");
    }
    for name in removed {
        info!("removed {name}");
    }

    Ok(())
}

fn run_init(opts: InitOptions) -> Result<()> {
    let name = match opts.name {
        Some(name) => name,
        None => opts
            .dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("cannot derive concept name from {:?}", opts.dir.display()))?,
    };

    if !is_valid_render_name(&name) {
        bail!("invalid concept name {name:?}: only lowercase letters (a-z), '-', and '_' are allowed");
    }
    init_concept(&opts.dir, &name, ConceptType::Jsonnet)?;

    Ok(())
}
