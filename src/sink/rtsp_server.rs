//! Built-in RTSP server publishing paced frames to any number of clients

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use color_eyre::{eyre::eyre, Result};
use gstreamer as gst;
use gstreamer::glib::{self, MainContext, MainLoop};
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_rtsp_server::prelude::*;
use gstreamer_rtsp_server::{RTSPMedia, RTSPMediaFactory, RTSPServer};
use tracing::{debug, info, warn};

use super::Sink;
use crate::capture::Frame;
use crate::error::SinkError;
use crate::OutputConfig;

/// `appsrc` of the most recently configured media
#[derive(Default)]
struct MediaSlot {
    appsrc: Option<gst_app::AppSrc>,
    /// Bumped on every `media-configure`
    epoch: u64,
}

/// Maps the relay's gap-free clock onto a media timeline that starts at zero
/// each time the shared media is (re)configured.
#[derive(Debug, Default)]
struct MediaTimeline {
    epoch: u64,
    base_ns: Option<u64>,
}

impl MediaTimeline {
    fn rebase(&mut self, epoch: u64, timestamp_ns: u64) -> u64 {
        if epoch != self.epoch {
            self.epoch = epoch;
            self.base_ns = None;
        }
        timestamp_ns - *self.base_ns.get_or_insert(timestamp_ns)
    }
}

/// Serves `rtsp://<bind_address>:<port><mount_point>` from a shared
/// `appsrc ! x264enc ! rtph264pay` media.
///
/// The sink becomes ready once a client has caused the media to be
/// configured and its appsrc has asked for data. When the last client
/// leaves, pushes fail with flushing and the sink goes back to not ready
/// until the next client connects.
pub struct RtspServerSink {
    url: String,
    slot: Arc<Mutex<MediaSlot>>,
    consumer: Arc<AtomicBool>,
    accepting: Arc<AtomicBool>,
    timeline: MediaTimeline,
    main_loop: MainLoop,
    thread: Option<JoinHandle<()>>,
}

/// What the server thread needs to mount the factory
struct Mount {
    address: String,
    port: u16,
    mount_point: String,
    launch: String,
    slot: Arc<Mutex<MediaSlot>>,
    consumer: Arc<AtomicBool>,
    accepting: Arc<AtomicBool>,
}

impl RtspServerSink {
    pub fn new(config: &OutputConfig, fps: u32) -> Result<Self> {
        gst::init().map_err(|e| eyre!("Failed to initialize GStreamer: {}", e))?;

        let launch = launch_description(config, fps);
        info!("RTSP media: {}", launch);

        let slot = Arc::new(Mutex::new(MediaSlot::default()));
        let consumer = Arc::new(AtomicBool::new(false));
        let accepting = Arc::new(AtomicBool::new(false));
        let mount = Mount {
            address: config.bind_address.clone(),
            port: config.port,
            mount_point: config.mount_point.clone(),
            launch,
            slot: slot.clone(),
            consumer: consumer.clone(),
            accepting: accepting.clone(),
        };

        let (started_tx, started_rx) = flume::bounded(1);
        let thread = thread::Builder::new()
            .name("rtsp-server".into())
            .spawn(move || serve(mount, started_tx))
            .map_err(|e| eyre!("Failed to spawn RTSP server: {}", e))?;

        let main_loop = match started_rx.recv() {
            Ok(Ok(main_loop)) => main_loop,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(eyre!("RTSP server thread exited during startup"));
            }
        };

        let url = url(config);
        info!("RTSP server ready at {}", url);

        Ok(Self {
            url,
            slot,
            consumer,
            accepting,
            timeline: MediaTimeline::default(),
            main_loop,
            thread: Some(thread),
        })
    }

    /// Address clients connect to
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Forget `appsrc` if it is still the current media
    fn detach(&self, appsrc: &gst_app::AppSrc) {
        let mut slot = lock(&self.slot);
        if slot.appsrc.as_ref() == Some(appsrc) {
            slot.appsrc = None;
            self.consumer.store(false, Ordering::Release);
            self.accepting.store(false, Ordering::Release);
            info!("RTSP media went away, waiting for a client");
        }
    }
}

/// Factory launch line; `pay0` is the payloader rtsp-server looks for
pub fn launch_description(config: &OutputConfig, fps: u32) -> String {
    format!(
        "( appsrc name=source is-live=true format=time \
         caps=video/x-raw,format={},width={},height={},framerate={}/1 ! \
         videoconvert ! video/x-raw,format=I420 ! \
         x264enc speed-preset=ultrafast tune=zerolatency ! \
         rtph264pay config-interval=1 name=pay0 pt=96 )",
        config.format.caps_name(),
        config.width,
        config.height,
        fps
    )
}

pub fn url(config: &OutputConfig) -> String {
    format!(
        "rtsp://{}:{}{}",
        config.bind_address, config.port, config.mount_point
    )
}

fn lock(slot: &Mutex<MediaSlot>) -> MutexGuard<'_, MediaSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Server thread: own GLib context, mount, report startup, run until quit
fn serve(mount: Mount, started: flume::Sender<Result<MainLoop>>) {
    let context = MainContext::new();
    let _guard = match context.acquire() {
        Ok(guard) => guard,
        Err(e) => {
            let _ = started.send(Err(eyre!("Failed to acquire GLib context: {}", e)));
            return;
        }
    };
    let main_loop = MainLoop::new(Some(&context), false);

    let (_server, source) = match attach(mount, &context) {
        Ok(attached) => attached,
        Err(e) => {
            let _ = started.send(Err(e));
            return;
        }
    };
    if started.send(Ok(main_loop.clone())).is_err() {
        source.remove();
        return;
    }

    main_loop.run();
    source.remove();
    debug!("RTSP server loop stopped");
}

fn attach(mount: Mount, context: &MainContext) -> Result<(RTSPServer, glib::SourceId)> {
    let server = RTSPServer::new();
    server.set_address(&mount.address);
    server.set_service(&mount.port.to_string());

    let mounts = server
        .mount_points()
        .ok_or_else(|| eyre!("RTSP server has no mount points"))?;
    let factory = RTSPMediaFactory::new();
    factory.set_launch(&mount.launch);
    // One encoder for every client
    factory.set_shared(true);

    let Mount {
        slot,
        consumer,
        accepting,
        ..
    } = mount;
    factory.connect_media_configure(move |_, media| {
        configure_media(media, &slot, &consumer, &accepting);
    });
    mounts.add_factory(&mount.mount_point, factory);

    let source = server.attach(Some(context)).map_err(|e| {
        eyre!(
            "Failed to bind RTSP server on {}:{}: {}",
            mount.address,
            mount.port,
            e
        )
    })?;
    Ok((server, source))
}

fn configure_media(
    media: &RTSPMedia,
    slot: &Mutex<MediaSlot>,
    consumer: &Arc<AtomicBool>,
    accepting: &Arc<AtomicBool>,
) {
    let appsrc = media
        .element()
        .downcast::<gst::Bin>()
        .ok()
        .and_then(|bin| bin.by_name("source"))
        .and_then(|element| element.downcast::<gst_app::AppSrc>().ok());
    let Some(appsrc) = appsrc else {
        warn!("RTSP media has no `appsrc name=source`");
        return;
    };

    appsrc.set_is_live(true);
    appsrc.set_format(gst::Format::Time);
    // Never let a slow encoder stall the pacer
    appsrc.set_property("block", false);

    accepting.store(false, Ordering::Release);
    appsrc.set_callbacks(
        gst_app::AppSrcCallbacks::builder()
            .need_data({
                let consumer = consumer.clone();
                let accepting = accepting.clone();
                move |_, _| {
                    if !consumer.swap(true, Ordering::AcqRel) {
                        info!("RTSP client requested data");
                    }
                    accepting.store(true, Ordering::Release);
                }
            })
            .enough_data({
                let accepting = accepting.clone();
                move |_| accepting.store(false, Ordering::Release)
            })
            .build(),
    );

    let mut slot = lock(slot);
    slot.appsrc = Some(appsrc);
    slot.epoch += 1;
    info!(epoch = slot.epoch, "RTSP media configured");
}

impl Sink for RtspServerSink {
    fn is_ready(&self) -> bool {
        self.consumer.load(Ordering::Acquire)
    }

    fn submit(&mut self, frame: Frame, timestamp_ns: u64, duration_ns: u64) -> Result<(), SinkError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(SinkError::Busy);
        }

        let (appsrc, epoch) = {
            let slot = lock(&self.slot);
            match &slot.appsrc {
                Some(appsrc) => (appsrc.clone(), slot.epoch),
                None => return Err(SinkError::NotReady),
            }
        };
        let pts = gst::ClockTime::from_nseconds(self.timeline.rebase(epoch, timestamp_ns));

        let mut buffer = gst::Buffer::from_slice(frame.data);
        {
            let buffer = buffer.make_mut();
            buffer.set_pts(pts);
            buffer.set_dts(pts);
            buffer.set_duration(gst::ClockTime::from_nseconds(duration_ns));
        }

        match appsrc.push_buffer(buffer) {
            Ok(_) => Ok(()),
            Err(gst::FlowError::Flushing) | Err(gst::FlowError::Eos) => {
                self.detach(&appsrc);
                Err(SinkError::NotReady)
            }
            Err(e) => {
                warn!("Error pushing buffer: {:?}", e);
                Err(SinkError::Busy)
            }
        }
    }

    fn close(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        if let Some(appsrc) = lock(&self.slot).appsrc.take() {
            if let Err(e) = appsrc.end_of_stream() {
                debug!("appsrc end-of-stream: {:?}", e);
            }
        }
        self.consumer.store(false, Ordering::Release);
        self.accepting.store(false, Ordering::Release);

        self.main_loop.quit();
        if thread.join().is_err() {
            warn!("RTSP server thread panicked");
        }
        info!("RTSP server at {} stopped", self.url);
    }
}

impl Drop for RtspServerSink {
    fn drop(&mut self) {
        self.close();
    }
}
