//! CLI module
//!
//! This module provides the command-line interface for the wbs-engine tool:
//! running the server, offline tree/comparison commands over JSON files, and
//! project commands against a running server.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use colored::Colorize;
use serde_json::Value;

use crate::{
    api::{serve, Client, ClientConfig, ServerConfig},
    consensus,
    models::{ComparisonResult, IdGenerator, ModelResults, Project, TaskList, TreeTask},
    mutate::{DeletePolicy, Edit},
    pipeline::{
        parse_task_list, FileStore, HttpAdapter, MemoryStore, ModelAdapter, Pipeline,
        PipelineConfig, ProjectStore, ReplayAdapter, DEFAULT_MODELS,
    },
    project::Core,
    renumber::renumber,
    session::SessionView,
    tree::{self, Addressing},
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// API server URL
    #[arg(short, long, env = "WBS_SERVER", default_value = "http://localhost:3000")]
    server: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the wbs-engine API server
    Serve {
        /// Port to listen on
        #[arg(short, long, env = "WBS_PORT", default_value_t = 3000)]
        port: u16,

        /// Models to analyze with (comma separated)
        #[arg(long, env = "WBS_MODELS", value_delimiter = ',')]
        models: Vec<String>,

        /// Extraction service that turns a document into a task list
        #[arg(long, env = "WBS_EXTRACTOR_URL")]
        extractor_url: Option<String>,

        /// Directory of recorded `<model>.json` outputs to replay instead
        #[arg(long, env = "WBS_REPLAY_DIR")]
        replay_dir: Option<PathBuf>,

        /// Directory to persist projects in (in-memory when omitted)
        #[arg(long, env = "WBS_DATA_DIR")]
        data_dir: Option<PathBuf>,

        /// Seconds to wait for a single model before recording it as failed
        #[arg(long, env = "WBS_MODEL_TIMEOUT_SECS", default_value_t = 120)]
        timeout_secs: u64,

        /// Extra attempts for failed storage stages
        #[arg(long, env = "WBS_STAGE_RETRIES", default_value_t = 2)]
        retries: u32,

        /// Seconds before an edit session without unsaved changes is closed
        #[arg(long, env = "WBS_SESSION_IDLE_SECS", default_value_t = 1800)]
        session_idle_secs: u64,
    },

    /// Build and print the tree for a task list file
    Tree {
        /// JSON file with a task list
        file: PathBuf,

        /// How flat lists address their parents
        #[arg(long, value_enum, default_value_t = AddressingArg::Wbs)]
        addressing: AddressingArg,

        /// Renumber the tree after building it
        #[arg(long)]
        renumber: bool,
    },

    /// Compare task list files, one per model (model name = file stem)
    Compare {
        #[arg(required = true, num_args = 1..)]
        files: Vec<PathBuf>,
    },

    /// Project commands against a running server
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum AddressingArg {
    /// Parents derived from dot-separated WBS ids
    Wbs,
    /// Parents given by `parentId`
    Parent,
}

impl From<AddressingArg> for Addressing {
    fn from(arg: AddressingArg) -> Self {
        match arg {
            AddressingArg::Wbs => Addressing::WbsId,
            AddressingArg::Parent => Addressing::ParentRef,
        }
    }
}

#[derive(Subcommand)]
enum ProjectCommands {
    /// List projects
    List,

    /// Create a project
    Create {
        name: String,
        file_key: String,
        #[arg(long)]
        id: Option<String>,
    },

    /// Show a project with its model results and comparison
    Show { id: String },

    /// Analyze a project's document
    Analyze {
        id: String,
        /// Text file with the extracted document (reuses the stored one when omitted)
        #[arg(long)]
        document: Option<PathBuf>,
        /// Only run these models (comma separated)
        #[arg(long, value_delimiter = ',')]
        models: Vec<String>,
    },

    /// Re-run one model against the stored document
    Rerun { id: String, model: String },

    /// Ask one model to rework its results following instructions
    Refine {
        id: String,
        model: String,
        instructions: String,
    },

    /// Delete one model's results
    #[command(name = "delete-model")]
    DeleteModel { id: String, model: String },

    /// Make one model's output the active task list
    Promote { id: String, model: String },

    /// Show the editable tree
    Tree { id: String },

    /// Add a task after another one (or at the end of the roots)
    #[command(name = "add-task")]
    AddTask {
        id: String,
        #[arg(long)]
        after: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },

    /// Delete a task
    #[command(name = "delete-task")]
    DeleteTask {
        id: String,
        node_id: String,
        /// Keep the task's children in its place
        #[arg(long)]
        promote_children: bool,
    },

    /// Move a task under a new parent (or to the roots)
    #[command(name = "move-task")]
    MoveTask {
        id: String,
        node_id: String,
        #[arg(long)]
        parent: Option<String>,
        #[arg(long, default_value_t = 0)]
        index: usize,
    },

    /// Undo the last edit
    Undo { id: String },

    /// Redo the last undone edit
    Redo { id: String },

    /// Save the edited tree as the active task list
    Save { id: String },
}

/// Run the CLI application
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve {
            port,
            models,
            extractor_url,
            replay_dir,
            data_dir,
            timeout_secs,
            retries,
            session_idle_secs,
        } => {
            println!("Starting wbs-engine API server on port {}...", port);

            let models = if models.is_empty() {
                DEFAULT_MODELS.clone()
            } else {
                models.clone()
            };
            let store: Arc<dyn ProjectStore> = match data_dir {
                Some(dir) => Arc::new(FileStore::new(dir.clone())),
                None => Arc::new(MemoryStore::new()),
            };
            let config = PipelineConfig {
                models: models.clone(),
                timeout: Duration::from_secs(*timeout_secs),
                stage_retries: *retries,
            };

            let mut pipeline = Pipeline::new(store, config);
            for model in &models {
                let adapter: Arc<dyn ModelAdapter> = match (replay_dir, extractor_url) {
                    (Some(dir), _) => Arc::new(ReplayAdapter::new(model.clone(), dir.clone())),
                    (None, Some(url)) => Arc::new(HttpAdapter::new(model.clone(), url.clone())),
                    (None, None) => continue,
                };
                pipeline = pipeline.with_adapter(adapter);
            }
            if replay_dir.is_none() && extractor_url.is_none() {
                println!(
                    "{}",
                    "No extractor URL or replay directory set; every model run will be recorded as failed."
                        .yellow()
                );
            }

            let config = ServerConfig {
                address: ([127, 0, 0, 1], *port).into(),
            };
            let core =
                Core::new(pipeline).with_session_idle(Duration::from_secs(*session_idle_secs));
            serve(core, config).await?;
            Ok(())
        }

        Commands::Tree {
            file,
            addressing,
            renumber: renumber_after,
        } => {
            let list = read_task_list(file)?;
            let mut ids = IdGenerator::new();
            let forest = match &list {
                TaskList::Flat(tasks) => tree::build_tree(tasks, (*addressing).into(), &mut ids),
                TaskList::Tree(_) => list.to_forest(&mut ids),
            };
            let forest = if *renumber_after {
                renumber(forest)
            } else {
                forest
            };
            print_forest(&forest, 0);
            Ok(())
        }

        Commands::Compare { files } => {
            let mut results = Vec::new();
            for file in files {
                let model = file
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("unknown")
                    .to_string();
                match read_task_list(file) {
                    Ok(mut list) => {
                        list.sort_by_wbs_id();
                        results.push(ModelResults::success(model, list));
                    }
                    Err(e) => results.push(ModelResults::failure(model, e.to_string())),
                }
            }
            print_comparison(&consensus::compare(&results));
            Ok(())
        }

        Commands::Project { command } => {
            let client = create_client(&cli.server);
            match command {
                ProjectCommands::List => {
                    let projects = client.list_projects().await?;
                    if projects.is_empty() {
                        println!("No projects yet. Create one with 'wbs-engine project create'");
                    }
                    for project in projects {
                        println!(
                            "{}  {} ({})",
                            project.id.dimmed(),
                            project.name.bold(),
                            project.file_key
                        );
                    }
                }
                ProjectCommands::Create { name, file_key, id } => {
                    let project = client
                        .create_project(id.clone(), name.clone(), file_key.clone())
                        .await?;
                    println!("Project {} ready", project.id.bold());
                }
                ProjectCommands::Show { id } => {
                    print_project(&client.get_project(id).await?);
                }
                ProjectCommands::Analyze {
                    id,
                    document,
                    models,
                } => {
                    let document = match document {
                        Some(path) => Some(std::fs::read_to_string(path)?),
                        None => None,
                    };
                    let models = if models.is_empty() {
                        None
                    } else {
                        Some(models.clone())
                    };
                    print_project(&client.analyze(id, document, models).await?);
                }
                ProjectCommands::Rerun { id, model } => {
                    print_project(&client.rerun_model(id, model).await?);
                }
                ProjectCommands::Refine {
                    id,
                    model,
                    instructions,
                } => {
                    print_project(
                        &client
                            .refine_model(id, model, instructions.clone())
                            .await?,
                    );
                }
                ProjectCommands::DeleteModel { id, model } => {
                    print_project(&client.delete_model(id, model).await?);
                }
                ProjectCommands::Promote { id, model } => {
                    let project = client.promote(id, model).await?;
                    println!(
                        "Promoted {} ({} tasks) to the active task list",
                        model.bold(),
                        project.tree.len()
                    );
                }
                ProjectCommands::Tree { id } => {
                    print_session(&client.tree(id).await?);
                }
                ProjectCommands::AddTask { id, after, name } => {
                    print_edit(&client.insert_task(id, after.clone(), name.clone()).await?);
                }
                ProjectCommands::DeleteTask {
                    id,
                    node_id,
                    promote_children,
                } => {
                    let policy = if *promote_children {
                        DeletePolicy::PromoteChildren
                    } else {
                        DeletePolicy::Cascade
                    };
                    print_edit(&client.delete_task(id, node_id.clone(), policy).await?);
                }
                ProjectCommands::MoveTask {
                    id,
                    node_id,
                    parent,
                    index,
                } => {
                    print_edit(
                        &client
                            .move_task(id, node_id.clone(), parent.clone(), *index)
                            .await?,
                    );
                }
                ProjectCommands::Undo { id } => {
                    print_session(&client.undo(id).await?);
                }
                ProjectCommands::Redo { id } => {
                    print_session(&client.redo(id).await?);
                }
                ProjectCommands::Save { id } => {
                    let project = client.save_tree(id).await?;
                    println!("Saved {} rows", project.tree.len());
                }
            }
            Ok(())
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(*shell, &mut cmd, name, &mut io::stdout());
            Ok(())
        }
    }
}

fn create_client(server_url: &str) -> Client {
    let config = ClientConfig {
        base_url: server_url.to_string(),
    };

    Client::with_config(config)
}

fn read_task_list(path: &Path) -> Result<TaskList, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    let body: Value = serde_json::from_str(&text)?;
    Ok(parse_task_list(body)?)
}

fn print_forest(nodes: &[TreeTask], indent: usize) {
    for node in nodes {
        println!(
            "{}{} {} {}",
            "  ".repeat(indent),
            node.wbs_id.as_deref().unwrap_or("-").dimmed(),
            node.name,
            format!("[{}]", node.id).dimmed()
        );
        print_forest(&node.children, indent + 1);
    }
}

fn print_comparison(comparison: &ComparisonResult) {
    println!("{}", comparison.summary.bold());
    for task in &comparison.tasks {
        let status = match task.status {
            crate::models::TaskStatus::Pass => "pass".green(),
            crate::models::TaskStatus::NeedsReview => "needs review".yellow(),
        };
        println!(
            "{:<10} {:<40} {:<14} {}",
            task.wbs_id,
            task.name,
            status,
            task.sources.join(",").dimmed()
        );
        if let Some(discrepancies) = &task.discrepancies {
            println!("{:<10} {}", "", discrepancies.italic());
        }
    }
}

fn print_project(project: &Project) {
    println!("{} ({})", project.name.bold(), project.id.dimmed());
    println!("  File: {}", project.file_key);
    if let Some(updated) = project.last_updated {
        println!("  Updated: {}", updated.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    println!("\nModels:");
    if project.model_results.is_empty() {
        println!("  Not analyzed yet");
    }
    for result in &project.model_results {
        match &result.error {
            Some(error) => println!("  {} {}", result.model.red(), error),
            None => println!("  {} {} tasks", result.model.green(), result.results.len()),
        }
    }

    println!();
    match &project.comparison_result {
        Some(comparison) => print_comparison(comparison),
        None => println!("No comparison (needs at least two models)"),
    }

    if !project.tree.is_empty() {
        println!("\nActive task list: {} rows", project.tree.len());
    }
}

fn print_session(view: &SessionView) {
    if view.forest.is_empty() {
        println!("No tasks yet. Promote a model or add tasks with 'wbs-engine project add-task'");
    }
    print_forest(&view.forest, 0);
    let mut flags = Vec::new();
    if view.dirty {
        flags.push("unsaved changes".yellow().to_string());
    }
    if view.can_undo {
        flags.push("undo available".to_string());
    }
    if view.can_redo {
        flags.push("redo available".to_string());
    }
    if !flags.is_empty() {
        println!("\n{}", flags.join(" · "));
    }
}

fn print_edit(edit: &Edit) {
    if edit.is_applied() {
        println!("{}", "Applied".green());
    } else {
        println!("{} {:?}", "Not applied:".yellow(), edit.outcome);
    }
    print_forest(&edit.forest, 0);
}
