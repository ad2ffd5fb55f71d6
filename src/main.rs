#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use peer8::config::Config;

fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    simple_logger::init_with_level(config.log.level.as_level())?;

    peer8::startup(config)
}
