use blazepose::{common::*, config::Config, trainer};

lazy_static::lazy_static! {
    static ref SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);
}

/// Train a BlazePose human pose estimation model.
#[derive(FromArgs)]
struct Args {
    /// the configuration file.
    #[argh(option, short = 'c', default = "PathBuf::from(\"config.json\")")]
    conf_file: PathBuf,
}

fn main() -> Fallible<()> {
    pretty_env_logger::init();

    // Set signal handler
    ctrlc::set_handler(|| {
        warn!("Interrupted by user");
        SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
    })?;

    // Parse arguments
    let args: Args = argh::from_env();

    // load config
    let config = Config::open(&args.conf_file)?;

    trainer::train(&config, &SHUTDOWN_FLAG)
}
