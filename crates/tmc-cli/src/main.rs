//! TMC command-line client
//!
//! Plays the IDE's role for the client core: the course workspace is the
//! `.code-workspace` descriptor file, notifications go to the terminal and
//! credentials and settings live under the data directory.

mod terminal;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tmc_client::{HttpClient, LangsRunner};
use tmc_core::{
    Config, CourseCoordinator, CourseRecord, DataPaths, ExerciseRecord, ExerciseStatus,
    ExerciseStore, FeedbackAnswer, FeedbackKind, FileCredentialStore, FileWorkspaceHost,
    JsonSettingsStore, NotificationSink, RemoteClient, RunStatus, SubmissionEvent,
    SubmissionOrchestrator, SubmissionOutcome, SubmissionVerdict, TestRunOutcome, TmcError,
    UserDataStore, WorkspaceContext, WorkspaceReconciler,
};
use tracing_subscriber::EnvFilter;

use crate::terminal::{prompt_line, TerminalSink};

/// TMC - TestMyCode exercise client
///
/// Download exercises, run their tests locally and submit them for grading.
#[derive(Parser, Debug)]
#[command(name = "tmc")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: tmc.json in current directory)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<String>,

    /// Data directory for projects, workspaces and state
    #[arg(long, value_name = "DIR", global = true)]
    data_dir: Option<String>,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Answer every prompt with its first choice
    #[arg(short = 'y', long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in to the TMC server
    Login {
        /// Username or email
        #[arg(short, long)]
        username: String,
        /// Password (prompted for if omitted)
        #[arg(long, env = "TMC_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Log out and forget the stored token
    Logout,
    /// List organizations
    Orgs,
    /// List the courses of an organization
    Courses {
        /// Organization slug
        org: String,
    },
    /// Add a course and create its workspace file
    AddCourse {
        /// Organization slug
        org: String,
        /// Course id
        course_id: u64,
    },
    /// Remove a course and its exercise records
    RemoveCourse {
        /// Course name
        course: String,
    },
    /// Refresh courses and offer new exercises
    Update {
        /// Only check this course
        #[arg(long)]
        course: Option<String>,
    },
    /// Download exercises of a course
    Download {
        /// Course name
        course: String,
        /// Download every exercise not on disk instead of only new ones
        #[arg(long)]
        all: bool,
    },
    /// Open exercises in the course workspace
    Open {
        /// Course name
        course: String,
        /// Exercise names
        #[arg(required = true)]
        exercises: Vec<String>,
    },
    /// Close exercises in the course workspace
    Close {
        /// Course name
        course: String,
        /// Exercise names
        #[arg(required = true)]
        exercises: Vec<String>,
    },
    /// Run an exercise's tests locally
    Test {
        /// Course name
        course: String,
        /// Exercise name
        exercise: String,
    },
    /// Submit an exercise for grading
    Submit {
        /// Course name
        course: String,
        /// Exercise name
        exercise: String,
        /// Stop waiting once the submission is uploaded
        #[arg(long)]
        detach: bool,
    },
    /// Send an exercise to the paste service
    Paste {
        /// Course name
        course: String,
        /// Exercise name
        exercise: String,
    },
    /// Show courses and exercise status
    Status {
        /// Only show this course
        course: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(config = ?args.config, data_dir = ?args.data_dir, "Starting tmc");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(1)
        }
    }
}

fn load_config(config_path: Option<&str>) -> anyhow::Result<Config> {
    match config_path {
        Some(path_str) => {
            let path = Path::new(path_str);
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: '{}'\n\nSuggestion: Check the path or remove the --config flag to use defaults",
                    path.display()
                );
            }
            Config::load_from_file(path).map_err(|e| anyhow::anyhow!("{e}"))
        }
        None => Config::load().map_err(|e| anyhow::anyhow!("{e}")),
    }
}

// ============================================================================
// Wiring
// ============================================================================

/// Every service a command may need, wired for one optional active course.
struct App {
    config: Config,
    paths: DataPaths,
    remote: Arc<HttpClient>,
    sink: Arc<TerminalSink>,
    workspace: Arc<WorkspaceReconciler>,
    courses: CourseCoordinator,
    submissions: SubmissionOrchestrator,
    ctx: WorkspaceContext,
}

impl App {
    fn new(config: Config, yes: bool, active_course: Option<&str>) -> anyhow::Result<Self> {
        let paths = config.paths();
        let credentials = Arc::new(FileCredentialStore::new(&paths.credentials));
        let remote = Arc::new(HttpClient::new(&config, credentials)?);
        let runner = Arc::new(LangsRunner::new(&config.langs_cli, paths.root.join("tmp")));
        let sink = Arc::new(TerminalSink { assume_yes: yes });

        let store = Arc::new(ExerciseStore::open(&paths.exercises, &paths.projects)?);
        let settings = Arc::new(JsonSettingsStore::open(&paths.settings)?);
        let user_data = Arc::new(UserDataStore::open(&paths.user_data)?);

        let workspace_file = active_course.map(|c| paths.workspace_file(c));
        let host = FileWorkspaceHost::new(
            workspace_file
                .clone()
                .unwrap_or_else(|| paths.workspaces.clone()),
        );
        let ctx = workspace_file.map_or_else(WorkspaceContext::none, WorkspaceContext::new);

        let workspace = Arc::new(WorkspaceReconciler::new(
            store,
            Arc::new(host),
            settings,
            paths.clone(),
            config.editor,
        ));
        let courses = CourseCoordinator::new(
            remote.clone(),
            runner.clone(),
            sink.clone(),
            user_data,
            workspace.clone(),
            paths.clone(),
            config.notification_delay(),
        );
        let submissions = SubmissionOrchestrator::new(remote.clone(), runner, config.submission.clone());

        Ok(Self {
            config,
            paths,
            remote,
            sink,
            workspace,
            courses,
            submissions,
            ctx,
        })
    }

    /// Brings the exercise records of every added course in line with disk.
    async fn refresh_local_exercises(&self) {
        let courses: Vec<String> = self
            .courses
            .user_data()
            .courses()
            .into_iter()
            .map(|c| c.name)
            .collect();
        if let Err(e) = self.workspace.refresh_local_exercises(&courses).await {
            tracing::warn!(error = %e, "Failed to refresh local exercises");
        }
    }

    fn course(&self, name: &str) -> anyhow::Result<CourseRecord> {
        self.courses
            .user_data()
            .get_course_by_name(name)
            .ok_or_else(|| TmcError::course_not_found(name).into())
    }

    /// Resolves an exercise to its platform id and local record.
    fn exercise(&self, course: &str, exercise: &str) -> anyhow::Result<(CourseRecord, u64, ExerciseRecord)> {
        let record = self.course(course)?;
        let id = record
            .exercise_by_name(exercise)
            .map(|e| e.id)
            .ok_or_else(|| TmcError::exercise_not_found(course, exercise))?;
        let local = self
            .workspace
            .store()
            .get(course, exercise)
            .ok_or_else(|| TmcError::exercise_not_found(course, exercise))
            .context("Exercise has not been downloaded")?;
        Ok((record, id, local))
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(ref data_dir) = args.data_dir {
        config.data_dir.clone_from(data_dir);
    }
    config.validate()?;

    let active_course = match &args.command {
        Command::Open { course, .. }
        | Command::Close { course, .. }
        | Command::Download { course, .. }
        | Command::Test { course, .. }
        | Command::Submit { course, .. }
        | Command::Paste { course, .. } => Some(course.as_str()),
        _ => None,
    };
    let app = App::new(config, args.yes, active_course)?;
    app.workspace.ensure_root().await?;
    app.refresh_local_exercises().await;

    match args.command {
        Command::Login { username, password } => login(&app, &username, password).await,
        Command::Logout => {
            app.remote.deauthenticate().await?;
            println!("Logged out.");
            Ok(())
        }
        Command::Orgs => {
            for org in app.remote.get_organizations().await? {
                println!("{:<24} {}", org.slug, org.name);
            }
            Ok(())
        }
        Command::Courses { org } => {
            for course in app.remote.get_courses(&org).await? {
                println!("{:<8} {:<32} {}", course.id, course.name, course.title);
            }
            Ok(())
        }
        Command::AddCourse { org, course_id } => {
            let course = app.courses.add_course(&org, course_id).await?;
            println!(
                "Added {} ({} exercises). Workspace: {}",
                course.title,
                course.exercises.len(),
                app.paths.workspace_file(&course.name).display()
            );
            Ok(())
        }
        Command::RemoveCourse { course } => {
            let record = app.course(&course)?;
            app.courses.remove_course(record.id)?;
            println!("Removed {}.", record.title);
            Ok(())
        }
        Command::Update { course } => {
            let id = course.as_deref().map(|c| app.course(c)).transpose()?.map(|c| c.id);
            app.courses.check_for_course_updates(id).await?;
            Ok(())
        }
        Command::Download { course, all } => download(&app, &course, all).await,
        Command::Open { course, exercises } => {
            let names: Vec<&str> = exercises.iter().map(String::as_str).collect();
            app.workspace.open_exercises(&app.ctx, &course, &names).await?;
            println!("Opened {} exercise(s).", names.len());
            Ok(())
        }
        Command::Close { course, exercises } => {
            let names: Vec<&str> = exercises.iter().map(String::as_str).collect();
            app.workspace.close_exercises(&app.ctx, &course, &names).await?;
            println!("Closed {} exercise(s).", names.len());
            Ok(())
        }
        Command::Test { course, exercise } => test(&app, &course, &exercise).await,
        Command::Submit {
            course,
            exercise,
            detach,
        } => submit(&app, &course, &exercise, detach).await,
        Command::Paste { course, exercise } => {
            let (_, id, local) = app.exercise(&course, &exercise)?;
            let link = app.submissions.paste(id, &local.local_path).await?;
            println!("{link}");
            Ok(())
        }
        Command::Status { course } => status(&app, course.as_deref()),
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn login(app: &App, username: &str, password: Option<String>) -> anyhow::Result<()> {
    let password = match password {
        Some(p) => p,
        None => prompt_line("Password: ")
            .await
            .context("No password given")?,
    };
    app.remote.authenticate(username, &password).await?;
    println!("Logged in to {}.", app.config.server_url);
    Ok(())
}

async fn download(app: &App, course: &str, all: bool) -> anyhow::Result<()> {
    let record = app.course(course)?;
    let report = if all {
        let store = app.workspace.store();
        let missing: Vec<u64> = record
            .exercises
            .iter()
            .filter(|e| {
                !matches!(
                    store.get(&record.name, &e.name).map(|r| r.status),
                    Some(ExerciseStatus::Open | ExerciseStatus::Closed)
                )
            })
            .map(|e| e.id)
            .collect();
        app.courses.download_exercises(record.id, &missing).await?
    } else {
        app.courses.download_new_exercises(record.id).await?
    };
    println!("Downloaded {} exercise(s).", report.downloaded.len());
    for (id, reason) in &report.failed {
        eprintln!("  exercise {id}: {reason}");
    }
    if report.failed.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} exercise(s) failed to download", report.failed.len())
    }
}

async fn test(app: &App, course: &str, exercise: &str) -> anyhow::Result<()> {
    let record = app.course(course)?;
    let local = app
        .workspace
        .store()
        .get(course, exercise)
        .ok_or_else(|| TmcError::exercise_not_found(course, exercise))?;

    let Some(run) = app
        .submissions
        .run_tests(&local.local_path, record.perhaps_exam_mode)?
    else {
        println!("Local tests are disabled for this course.");
        return Ok(());
    };

    let interrupt = run.interrupt_token();
    let outcome = tokio::select! {
        outcome = run.result() => outcome?,
        _ = tokio::signal::ctrl_c() => {
            interrupt.cancel();
            TestRunOutcome::Interrupted
        }
    };

    match outcome {
        TestRunOutcome::Interrupted => println!("Test run interrupted."),
        TestRunOutcome::Completed(result) => {
            for test in &result.test_results {
                let mark = if test.successful { "PASS" } else { "FAIL" };
                println!("{mark} {}", test.name);
                if !test.successful && !test.message.is_empty() {
                    println!("     {}", test.message);
                }
            }
            match result.status {
                RunStatus::Passed => println!("All tests passed."),
                RunStatus::TestsFailed => println!("Some tests failed."),
                RunStatus::CompileFailed => println!("Compilation failed."),
                RunStatus::TestrunInterrupted => println!("Test run interrupted."),
                RunStatus::GenericError => println!("Test run failed."),
            }
        }
    }
    Ok(())
}

async fn submit(app: &App, course: &str, exercise: &str, detach: bool) -> anyhow::Result<()> {
    let (record, id, local) = app.exercise(course, exercise)?;
    let mut handle = app.submissions.submit(id, &local.local_path)?;

    let mut outcome = None;
    let mut interrupted = false;
    while outcome.is_none() {
        let event = tokio::select! {
            event = handle.next_event() => event,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                handle.detach();
                continue;
            }
        };
        match event {
            Some(SubmissionEvent::SubmissionUrl(url)) => {
                println!("Submission: {url}");
                if detach {
                    handle.detach();
                } else {
                    println!("Waiting for results. Press Ctrl-C to stop waiting.");
                }
            }
            Some(SubmissionEvent::Progress { percent, message }) => {
                if let Some(message) = message {
                    println!("[{percent:>3}%] {message}");
                }
            }
            Some(SubmissionEvent::Escalated { elapsed }) => {
                let prompt = format!(
                    "Grading has taken {}s. The result will also be available on the submission page.",
                    elapsed.as_secs()
                );
                if wants_detach(app.sink.ask(&prompt, &ESCALATION_CHOICES).await) {
                    handle.detach();
                }
            }
            Some(SubmissionEvent::Finished(o)) => outcome = Some(o),
            None => break,
        }
    }

    match outcome {
        Some(SubmissionOutcome::Completed(verdict)) => {
            print_verdict(&verdict);
            ask_feedback(app, &verdict).await;
            app.courses.check_for_course_updates(Some(record.id)).await?;
            Ok(())
        }
        Some(SubmissionOutcome::Detached { submission_url }) => {
            match submission_url {
                Some(url) => println!("Stopped waiting. Results will be at {url}"),
                None => println!("Stopped waiting."),
            }
            Ok(())
        }
        Some(SubmissionOutcome::Aborted(reason)) => {
            println!("Submission aborted ({reason:?}).");
            Ok(())
        }
        Some(SubmissionOutcome::Failed(e)) => Err(e.into()),
        None => anyhow::bail!("Submission ended without a result"),
    }
}

/// Choices offered once grading takes long. The first one keeps waiting.
const ESCALATION_CHOICES: [&str; 2] = ["Keep waiting", "Stop waiting"];

fn wants_detach(answer: Option<usize>) -> bool {
    answer == Some(1)
}

fn print_verdict(verdict: &SubmissionVerdict) {
    let result = &verdict.result;
    for test in result.test_cases.iter().flatten() {
        let mark = if test.successful { "PASS" } else { "FAIL" };
        println!("{mark} {}", test.name);
        if let Some(message) = test.message.as_deref().filter(|_| !test.successful) {
            println!("     {message}");
        }
    }
    if let Some(error) = &result.error {
        println!("{error}");
    }
    if result.all_tests_passed == Some(true) {
        println!("All tests passed on the server.");
    } else {
        println!("Status: {:?}", result.status);
    }
    if !result.points.is_empty() {
        println!("Points awarded: {}", result.points.join(", "));
    }
    if let Some(url) = &result.solution_url {
        println!("Model solution: {url}");
    }
}

async fn ask_feedback(app: &App, verdict: &SubmissionVerdict) {
    let Some(url) = verdict.result.feedback_answer_url.as_deref() else {
        return;
    };
    if verdict.feedback_questions.is_empty() || app.sink.assume_yes {
        return;
    }

    let mut answers = Vec::new();
    for question in &verdict.feedback_questions {
        let hint = match question.kind {
            FeedbackKind::Text => String::new(),
            FeedbackKind::IntRange { lower, upper } => format!(" [{lower}-{upper}]"),
        };
        let Some(answer) = prompt_line(&format!("{}{hint}: ", question.question)).await else {
            return;
        };
        if answer.is_empty() {
            continue;
        }
        if !question.kind.accepts(&answer) {
            eprintln!("Answer out of range, skipped.");
            continue;
        }
        answers.push(FeedbackAnswer {
            question_id: question.id,
            answer,
        });
    }
    if answers.is_empty() {
        return;
    }
    match app.submissions.submit_feedback(url, &answers).await {
        Ok(()) => println!("Feedback sent. Thank you!"),
        Err(e) => {
            app.sink
                .notify(tmc_core::NotificationLevel::Error, &format!("Failed to send feedback: {e}"))
                .await;
        }
    }
}

fn status(app: &App, course: Option<&str>) -> anyhow::Result<()> {
    let courses = match course {
        Some(name) => vec![app.course(name)?],
        None => app.courses.user_data().courses(),
    };
    if courses.is_empty() {
        println!("No courses added.");
    }
    let store = app.workspace.store();
    for course in courses {
        let mut flags = Vec::new();
        if course.disabled {
            flags.push("disabled");
        }
        if course.perhaps_exam_mode {
            flags.push("exam");
        }
        println!(
            "{} ({}/{} points){}",
            course.title,
            course.awarded_points,
            course.available_points,
            if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(", "))
            }
        );
        for exercise in &course.exercises {
            let state = match store.get(&course.name, &exercise.name).map(|r| r.status) {
                Some(ExerciseStatus::Open) => "open",
                Some(ExerciseStatus::Closed) => "closed",
                Some(ExerciseStatus::Missing) => "missing",
                None => "not downloaded",
            };
            let new = if course.new_exercise_ids.contains(&exercise.id) {
                " (new)"
            } else {
                ""
            };
            let done = if exercise.passed { "x" } else { " " };
            println!("  [{done}] {:<40} {state}{new}", exercise.name);
        }
    }
    Ok(())
}
