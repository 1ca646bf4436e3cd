//! ssmctl - offline CLI companion to ssmd
//!
//! Reads configuration and on-disk state directly; there is no daemon
//! listener to talk to (spec Non-goals rule out a control-plane API).

use clap::{Parser, Subcommand};
use ssm_core::config::{SceneTagsDocument, Settings, SourcePriorityDocument};
use ssm_core::equivalence::{EquivalenceCatalog, EquivalenceDocument};
use ssm_core::metadata_state::{parse_snapshot as parse_metadata_snapshot, MetadataStateSnapshot};
use ssm_core::normalize::{comparison_key, SceneTag};
use ssm_core::planner::{plan_group, OverrideVolume, RealDirExists, SourceBranch};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "ssmctl", about = "Offline inspection tool for ssmd")]
struct Cli {
    #[arg(long, env = "SSM_CONFIG_DIR", default_value = "/ssm/config")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Parse every config document and report the first error found.
    ValidateConfig,
    /// Print currently mounted ssm-managed mergerfs mounts and the
    /// metadata state snapshot.
    Status,
    /// Print the branch plan ssmd would build for a given display title.
    PrintPlanForTitle {
        /// Display title as it appears under a source volume.
        title: String,
    },
}

fn main() {
    let cli = Cli::parse();
    let result = match &cli.command {
        Cmd::ValidateConfig => validate_config(&cli.config_dir),
        Cmd::Status => status(&cli.config_dir),
        Cmd::PrintPlanForTitle { title } => print_plan_for_title(&cli.config_dir, title),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn validate_config(config_dir: &Path) -> eyre::Result<()> {
    let settings = Settings::from_file(&config_dir.join("settings.yml"))?;
    println!("settings.yml: ok");

    let scene_tags_doc = SceneTagsDocument::from_file(&config_dir.join("scene_tags.yml"))?;
    println!("scene_tags.yml: ok ({} tags)", scene_tags_doc.tags.len());
    let scene_tags = scene_tags_doc.to_scene_tags();

    let source_priority = SourcePriorityDocument::from_file(&config_dir.join("source_priority.yml"))?;
    println!("source_priority.yml: ok ({} sources ranked)", source_priority.sources.len());

    let equivalents_path = config_dir.join("manga_equivalents.yml");
    let document: EquivalenceDocument = match std::fs::read_to_string(&equivalents_path) {
        Ok(contents) => serde_yaml::from_str(&contents)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => EquivalenceDocument::default(),
        Err(e) => return Err(e.into()),
    };
    let catalog = EquivalenceCatalog::build(document, &scene_tags)
        .map_err(|reason| eyre::eyre!("manga_equivalents.yml failed validation: {reason}"))?;
    println!(
        "manga_equivalents.yml: ok ({} canonical groups)",
        catalog.document().groups.len()
    );

    println!("sources_root: {}", settings.sources_root.display());
    println!("override_root: {}", settings.override_root.display());
    println!("merged_root: {}", settings.merged_root.display());
    println!("state_dir: {}", settings.state_dir.display());
    Ok(())
}

fn status(config_dir: &Path) -> eyre::Result<()> {
    let settings = Settings::from_file(&config_dir.join("settings.yml"))?;

    println!("-- managed mounts (findmnt) --");
    let output = Command::new("findmnt")
        .args(["-P", "-o", "TARGET,FSTYPE,SOURCE,OPTIONS"])
        .stdin(Stdio::null())
        .output()?;
    let entries = ssmd::mount_snapshot::parse_snapshot(&String::from_utf8_lossy(&output.stdout));
    let merged_root = settings.merged_root.to_string_lossy().into_owned();
    let managed: Vec<_> = entries.iter().filter(|e| e.mountpoint.starts_with(&merged_root)).collect();
    if managed.is_empty() {
        println!("(none)");
    }
    for entry in managed {
        println!("{}  fstype={}  identity={}", entry.mountpoint, entry.fstype, entry.identity);
    }

    println!("-- metadata state --");
    let state_path = settings.state_dir.join("metadata_state.json");
    let snapshot: MetadataStateSnapshot = match std::fs::read(&state_path) {
        Ok(bytes) => parse_metadata_snapshot(&bytes).unwrap_or_default(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => MetadataStateSnapshot::default(),
        Err(e) => return Err(e.into()),
    };
    match snapshot.sticky_flaresolverr_until_unix_seconds {
        Some(until) => println!("sticky_flaresolverr_until_unix_seconds: {until}"),
        None => println!("sticky_flaresolverr_until_unix_seconds: (none)"),
    }
    if snapshot.title_cooldowns_unix_seconds.is_empty() {
        println!("title_cooldowns: (none)");
    } else {
        for (title, until) in &snapshot.title_cooldowns_unix_seconds {
            println!("title_cooldown  {title}  until={until}");
        }
    }
    Ok(())
}

fn print_plan_for_title(config_dir: &Path, title: &str) -> eyre::Result<()> {
    let settings = Settings::from_file(&config_dir.join("settings.yml"))?;
    let scene_tags: Vec<SceneTag> = SceneTagsDocument::from_file(&config_dir.join("scene_tags.yml"))?
        .to_scene_tags();
    let source_priority = SourcePriorityDocument::from_file(&config_dir.join("source_priority.yml"))?;

    let wanted_key = comparison_key(title, &scene_tags);

    let mut source_branches = Vec::new();
    for entry in read_dir_names(&settings.sources_root) {
        if settings.excluded_sources.iter().any(|n| n.eq_ignore_ascii_case(&entry)) {
            continue;
        }
        let volume_root = settings.sources_root.join(&entry);
        for title_dir in read_dir_names(&volume_root) {
            if comparison_key(&title_dir, &scene_tags) == wanted_key {
                source_branches.push(SourceBranch {
                    path: volume_root.join(&title_dir),
                    source_name: entry.clone(),
                });
            }
        }
    }
    source_branches.sort_by(|a, b| {
        source_priority
            .rank(&a.source_name)
            .cmp(&source_priority.rank(&b.source_name))
            .then_with(|| a.source_name.cmp(&b.source_name))
    });

    if source_branches.is_empty() {
        println!("no source directories match title {title:?}");
        return Ok(());
    }

    let override_volumes: Vec<OverrideVolume> = read_dir_names(&settings.override_root)
        .into_iter()
        .map(|name| OverrideVolume { root: settings.override_root.join(&name), name })
        .collect();

    let branch_links_root = settings.state_dir.join("branch-links");
    let plan = plan_group(
        &wanted_key,
        title,
        &branch_links_root,
        &override_volumes,
        &source_branches,
        &RealDirExists,
    );

    match plan {
        Some(plan) => {
            println!("group_id: {}", plan.group_id);
            println!("desired_identity: {}", plan.desired_identity);
            println!("staging_dir: {}", plan.staging_dir.display());
            println!("preferred_override_path: {}", plan.preferred_override_path.display());
            println!("branch_spec: {}", plan.branch_spec);
            println!("links:");
            for link in &plan.branch_links {
                println!(
                    "  {}  {} -> {}  ({})",
                    link.link_name,
                    link.link_path.display(),
                    link.target_path.display(),
                    link.mode.as_spec_token()
                );
            }
        }
        None => println!("no override volumes configured under {}", settings.override_root.display()),
    }
    Ok(())
}

fn read_dir_names(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect()
}
