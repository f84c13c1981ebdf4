use clap::Parser;
use dotenv::dotenv;
use mapmerge::config::Settings;
use mapmerge::listener::Listener;
use mapmerge::merge::MergeTool;
use mapmerge::pipeline::Pipeline;
use mapmerge::store::WmdsStore;
use std::sync::atomic::AtomicBool;

#[derive(Parser)]
#[command(name = "mapmerge")]
#[command(about = "Wafer-map merge worker: consumes lot documents, merges each wafer's maps, republishes the enriched lot", long_about = None)]
struct Cli {
    /// Broker hostname; overrides MAPMERGE_BROKER_URL
    hostname: Option<String>,
    /// Broker port, used together with the hostname
    #[arg(default_value_t = 5672)]
    port: u16,
}

fn main() {
    dotenv().ok();
    mapmerge::init_tracing("mapmerge");
    let cli = Cli::parse();

    let mut settings = Settings::from_env();
    if let Some(hostname) = cli.hostname {
        settings.broker_url = format!("amqp://guest:guest@{}:{}", hostname, cli.port);
    }

    println!("[mapmerge] broker: {}", settings.broker_url);
    println!("[mapmerge] input queue: {}", settings.input_queue);
    println!(
        "[mapmerge] destinations: {} / {}",
        settings.success_topic, settings.failure_topic
    );
    println!("[mapmerge] datastore: {}", settings.wmds_url);
    println!("[mapmerge] merge tool: {}", settings.merge_tool.display());

    let store = WmdsStore::new(settings.wmds_url.clone());
    let mut merge = MergeTool::new(&settings.merge_tool);
    if let Some(dir) = &settings.scratch_dir {
        merge = merge.with_scratch_dir(dir);
    }
    let pipeline = Pipeline::new(
        store,
        merge,
        settings.success_topic.clone(),
        settings.failure_topic.clone(),
    );
    let listener = Listener::new(
        settings.broker_url.clone(),
        settings.input_queue.clone(),
        settings.retry_initial,
        settings.retry_max,
    );

    // Runs until the process is stopped from outside.
    let shutdown = AtomicBool::new(false);
    listener.run(&pipeline, &shutdown);
}
