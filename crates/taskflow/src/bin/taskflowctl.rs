use std::env;
use std::sync::Arc;

use serde_json::json;
use sqlx::PgPool;
use taskflow::dead_letter::{DeadLetterStore, PgDeadLetterStore};
use taskflow::jobs::build_timeline;
use taskflow::ledger::PgLedger;
use taskflow::queue::{DispatchQueue, PgDispatchQueue};
use taskflow::tasks::{NewTask, PgTaskStore, TaskScheduler};
use taskflow::{db, telemetry};
use uuid::Uuid;

const USAGE: &str = "taskflowctl <command>\n\
     Commands:\n\
     - migrate\n\
     - reset\n\
     - seed <n>\n\
     - depth\n\
     - pause | resume\n\
     - timeline <job_id>\n\
     - dlq [limit]\n\
     - replay <dead_letter_id>\n\
     - purge <dead_letter_id>\n\
     \n\
     Uses TASKFLOW_DATABASE_URL, DATABASE_URL or TEST_DATABASE_URL.\n";

struct Stores {
    queue: Arc<PgDispatchQueue>,
    ledger: Arc<PgLedger>,
    dead_letters: Arc<PgDeadLetterStore>,
    scheduler: TaskScheduler,
}

impl Stores {
    fn new(pool: &PgPool) -> Self {
        let queue = Arc::new(PgDispatchQueue::new(pool.clone()));
        let ledger = Arc::new(PgLedger::new(pool.clone()));
        let dead_letters = Arc::new(PgDeadLetterStore::new(pool.clone()));
        let tasks = Arc::new(PgTaskStore::new(pool.clone()));
        let scheduler = TaskScheduler::new(tasks, queue.clone(), dead_letters.clone());
        Self {
            queue,
            ledger,
            dead_letters,
            scheduler,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing(&telemetry::LogConfig::default());

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }

    let url = env::var("TASKFLOW_DATABASE_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .or_else(|_| env::var("TEST_DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("TASKFLOW_DATABASE_URL, DATABASE_URL or TEST_DATABASE_URL must be set"))?;

    let pool = db::make_pool(&url).await?;
    let stores = Stores::new(&pool);

    match args[1].as_str() {
        "migrate" => {
            db::run_migrations(&pool).await?;
            println!("migrations OK");
        }
        "reset" => {
            db::reset(&pool).await?;
            println!("reset OK");
        }
        "seed" => {
            let n: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(10);
            seed(&stores, n).await?;
        }
        "depth" => {
            let depth = stores.queue.depth().await?;
            println!("{}", serde_json::to_string_pretty(&depth)?);
        }
        "pause" => {
            stores.queue.pause().await?;
            println!("queue paused");
        }
        "resume" => {
            stores.queue.resume().await?;
            println!("queue resumed");
        }
        "timeline" => {
            let job_id = parse_id(args.get(2), "timeline <job_id>")?;
            print_timeline(&stores, job_id).await?;
        }
        "dlq" => {
            let limit: i64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(50);
            for dl in stores.dead_letters.list(limit).await? {
                println!(
                    "{} | task={} job={} attempts={} | {} | {}",
                    dl.id, dl.task_id, dl.job_id, dl.attempts, dl.error.kind, dl.error.message
                );
            }
        }
        "replay" => {
            let id = parse_id(args.get(2), "replay <dead_letter_id>")?;
            let job = stores.scheduler.replay_dead_letter(id).await?;
            println!("replayed dead letter {id} as job {}", job.job_id);
        }
        "purge" => {
            let id = parse_id(args.get(2), "purge <dead_letter_id>")?;
            stores.scheduler.purge_dead_letter(id).await?;
            println!("purged dead letter {id}");
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn parse_id(arg: Option<&String>, usage: &str) -> anyhow::Result<Uuid> {
    let raw = arg.ok_or_else(|| anyhow::anyhow!("usage: taskflowctl {usage}"))?;
    Ok(raw.parse()?)
}

async fn seed(stores: &Stores, n: usize) -> anyhow::Result<()> {
    for i in 0..n {
        let name = if i % 2 == 0 { "demo_ok" } else { "fail_me" };
        let task = stores
            .scheduler
            .create_task(NewTask::one_time(name, "taskflowctl", json!({ "seq": i })))
            .await?;
        println!("+ created task {name} id={}", task.id);
    }
    Ok(())
}

async fn print_timeline(stores: &Stores, job_id: Uuid) -> anyhow::Result<()> {
    let timeline = build_timeline(
        stores.queue.as_ref(),
        stores.ledger.as_ref(),
        stores.dead_letters.as_ref(),
        job_id,
    )
    .await?;

    let Some(tl) = timeline else {
        println!("job {job_id} not found");
        return Ok(());
    };

    println!(
        "JOB: id={} task={} status={} last_worker={:?}",
        tl.job_id, tl.task_id, tl.status, tl.last_worker_id
    );
    if let Some(q) = &tl.queued {
        println!(
            "QUEUED: visible_at={} attempts={}/{} leased_by={:?}",
            q.visible_at, q.attempts_made, q.attempts_allowed, q.leased_by
        );
    }
    for event in &tl.story {
        println!("{}", serde_json::to_string(event)?);
    }
    Ok(())
}
