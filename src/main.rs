use mcm_client::daemon::config::Config;
use mcm_client::daemon::start::start_mcm_client;
use mcm_client::remote::control::ControlChannel;

#[tokio::main]
async fn main() {
    match Config::create() {
        Ok(config) => {
            if let Err(e) = start_mcm_client(config, ControlChannel::new()).await {
                eprintln!("MCM client failed: {}", e);
                ::std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("{}", e);
            ::std::process::exit(1);
        }
    }
}
