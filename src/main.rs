use clap::Parser;

#[tokio::main]
async fn main() {
    lancast::init_logs();
    lancast::cmd::Args::parse().run().await;
}
