use amiquip::{
    Connection, ConsumerMessage, ConsumerOptions, Exchange, FieldTable, Publish,
    QueueDeclareOptions,
};
use clap::Parser;
use dotenv::dotenv;
use mapmerge::config::Settings;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Submit a lot document to the merge worker's input queue, for smoke
/// testing a deployment end to end.
#[derive(Parser)]
#[command(name = "send-job")]
#[command(about = "Publish a lot XML file to the mapmerge input queue", long_about = None)]
struct Cli {
    /// Lot XML file to submit
    file: PathBuf,
    /// Input queue; overrides MAPMERGE_INPUT_QUEUE
    #[arg(long)]
    queue: Option<String>,
    /// Stay subscribed to the success topic and print what comes back
    #[arg(long)]
    listen: bool,
    /// How many seconds to wait while listening
    #[arg(long, default_value_t = 30)]
    wait: u64,
}

fn main() {
    dotenv().ok();
    mapmerge::init_tracing("send-job");
    let cli = Cli::parse();
    let settings = Settings::from_env();
    let queue_name = cli.queue.unwrap_or(settings.input_queue);

    let body = fs::read(&cli.file).expect("failed to read the lot file");

    let mut connection =
        Connection::insecure_open(&settings.broker_url).expect("failed to connect to the broker");
    let channel = connection.open_channel(None).expect("failed to open a channel");

    // Subscribe to the reply side first so a fast worker cannot answer
    // before we are listening.
    let reply_queue = if cli.listen {
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    ..QueueDeclareOptions::default()
                },
            )
            .expect("failed to declare a reply queue");
        channel
            .queue_bind(
                queue.name(),
                "amq.topic",
                settings.success_topic.as_str(),
                FieldTable::default(),
            )
            .expect("failed to bind the reply queue");
        Some(queue)
    } else {
        None
    };
    let consumer = reply_queue.as_ref().map(|queue| {
        queue
            .consume(ConsumerOptions::default())
            .expect("failed to subscribe to the reply queue")
    });

    channel
        .queue_declare(
            &queue_name,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
        )
        .expect("failed to declare the input queue");
    let exchange = Exchange::direct(&channel);
    exchange
        .publish(Publish::new(&body, queue_name.clone()))
        .expect("failed to publish the lot");
    println!("[send-job] published {} bytes to {}", body.len(), queue_name);

    if let Some(consumer) = consumer {
        println!(
            "[send-job] waiting up to {}s on {}",
            cli.wait, settings.success_topic
        );
        let deadline = Instant::now() + Duration::from_secs(cli.wait);
        while Instant::now() < deadline {
            match consumer.receiver().recv_timeout(Duration::from_millis(500)) {
                Ok(ConsumerMessage::Delivery(delivery)) => {
                    println!("[send-job] got {} bytes back:", delivery.body.len());
                    println!("{}", String::from_utf8_lossy(&delivery.body));
                    consumer.ack(delivery).expect("failed to ack the reply");
                    break;
                }
                Ok(_) => break,
                Err(_) => continue,
            }
        }
    }

    connection.close().expect("failed to close the connection");
}
