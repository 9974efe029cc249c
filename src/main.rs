//! vpp demo: camera -> encoder -> decoder -> display on virtual hardware

use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vpp::capture::{Camera, CameraOptions};
use vpp::codec::{CodecParams, Decoder, Encoder};
use vpp::display::{Display, DEFAULT_RECT_COLOR, DEFAULT_RECT_LINE_WIDTH, DEFAULT_TEXT_LINE_WIDTH};
use vpp::hal::virtual_hw::{HeapAllocator, LoopbackCodec, VirtualCamera, VirtualDisplay};
use vpp::hal::MemAllocator;
use vpp::pipeline::{bind, unbind, Module, PipeIdAllocator};
use vpp::{Config, CONFIG};

const DEFAULT_CONFIG_PATH: &str = "vpp.toml";

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vpp=info"));

    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::layer::SubscriberExt;
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()))
            .with(tracing_tracy::TracyLayer::default());
        tracing::subscriber::set_global_default(subscriber)?;
    }

    #[cfg(not(feature = "profiling"))]
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing()?;

    info!("vpp launching...");

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&path)?;
    CONFIG.store(Arc::new(config.clone()));
    info!("Using config {path}: {:?}", config);

    // Virtual hardware
    let allocator: Arc<dyn MemAllocator> = HeapAllocator::new();
    let sensor = VirtualCamera::new();
    let codec_hw = LoopbackCodec::new();
    let screen = VirtualDisplay::new();
    let pipes = PipeIdAllocator::new();

    let camera = Arc::new(Camera::new(sensor, Arc::clone(&allocator)));
    camera.open(&CameraOptions::from(&config.camera))?;

    let params = CodecParams::from(&config.codec);
    let encoder = Arc::new(Encoder::new(codec_hw.clone(), Arc::clone(&pipes)));
    encoder.open(params)?;
    let decoder = Arc::new(Decoder::new(codec_hw.clone(), Arc::clone(&pipes)));
    decoder.open(params, None)?;

    let display = Arc::new(Display::new(screen.clone(), Arc::clone(&allocator)));
    display.open(config.display.width, config.display.height)?;

    let stages: [Arc<dyn Module>; 4] = [
        camera.clone(),
        encoder.clone(),
        decoder.clone(),
        display.clone(),
    ];
    let chain: Vec<(Arc<dyn Module>, Arc<dyn Module>)> = stages
        .windows(2)
        .map(|pair| (Arc::clone(&pair[0]), Arc::clone(&pair[1])))
        .collect();
    for (up, down) in &chain {
        let channel = bind(Arc::clone(up), Arc::clone(down), None)?;
        info!("bound {} -> {} on channel {channel}", up.kind(), down.kind());
    }

    display.draw_rect(
        64,
        64,
        config.display.width as i32 / 2,
        config.display.height as i32 / 2,
        true,
        DEFAULT_RECT_COLOR,
        DEFAULT_RECT_LINE_WIDTH,
    )?;
    display.draw_text(64, 32, "vpp virtual pipeline", false, 0xffffffff, DEFAULT_TEXT_LINE_WIDTH)?;

    // Stats ticker
    let sinks: Vec<Arc<dyn Module>> = chain.iter().map(|(_, down)| Arc::clone(down)).collect();
    let ticker = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            for sink in &sinks {
                let m = sink.core().link_metrics();
                info!(
                    module = %sink.kind(),
                    state = ?sink.bind_state(),
                    frames = m.frames_forwarded,
                    timeouts = m.timeouts,
                    errors = m.errors,
                    "link stats"
                );
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("vpp shutting down");
    ticker.abort();

    for (up, down) in &chain {
        if let Err(e) = unbind(up.as_ref(), down.as_ref()) {
            warn!("unbind {} -> {}: {e}", up.kind(), down.kind());
        }
    }
    info!(presented = screen.frame_markers().len(), "frames displayed");

    display.close()?;
    decoder.close()?;
    encoder.close()?;
    camera.close()?;
    Ok(())
}
