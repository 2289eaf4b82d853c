//! Desktop simulator for the picocom pipeline.
//!
//! [`Simulator`] owns a submission client and both VDP cores, linked by
//! in-process loopback channels. A service hook on the client's endpoint
//! polls both cores, so every blocking client call drives the whole
//! pipeline on the calling thread.

/// Simulator errors
pub mod error;

/// Scripted demo scene
pub mod demo;

/// PPM export of the displayed frame
pub mod ppm;

use std::cell::{Ref, RefCell};
use std::path::Path;
use std::rc::Rc;

use picocom_gpu::client::{ClientConfig, ClientStats, SubmissionClient, DEFAULT_POOL_SIZE};
use picocom_gpu::cmd_list::CommandBuffer;
use picocom_gpu::flash::{MemoryFlash, FLASH_PAGE_SIZE};
use picocom_gpu::gpu::dump::dump;
use picocom_gpu::gpu::{CommandTable, GpuConfig};
use picocom_gpu::loopback::{self, LoopbackEndpoint, LoopbackError, Service};
use picocom_gpu::protocol::{BlendMode, BufferArena, CompleteFlags, TextureFormat};
use picocom_gpu::tile::{FrameBuffer, ALL_TILES};
use picocom_gpu::upload::{upload_buffer, BufferAllocator, Vdp, FIRST_USER_BUFFER_ID};
use picocom_gpu::vdp::{PerfCounters, Vdp1Core, Vdp2Core};
use picocom_hal::FlashDevice;

pub use error::{Result, SimError};

/// Upper bound on `SimConfig::pool_size`.
pub const MAX_POOL_SIZE: usize = 8;

/// Flash window size of each simulated core, in pages.
pub const DEFAULT_FLASH_PAGES: usize = 16;

pub type SimClient = SubmissionClient<LoopbackEndpoint, MAX_POOL_SIZE>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimConfig {
    /// Command buffers in flight, clamped to `1..=MAX_POOL_SIZE`.
    pub pool_size: usize,
    /// Arena the demo sprite is uploaded to.
    pub sprite_arena: BufferArena,
    pub flash_pages: usize,
    pub gpu: GpuConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            sprite_arena: BufferArena::Ram0,
            flash_pages: DEFAULT_FLASH_PAGES,
            gpu: GpuConfig::default(),
        }
    }
}

/// Counters gathered after a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimReport {
    pub frames: u32,
    pub flips: u32,
    pub client: ClientStats,
    pub vdp1: PerfCounters,
    pub vdp2: PerfCounters,
    pub vdp1_pages_programmed: u32,
}

type Fault = Rc<RefCell<Option<(u8, LoopbackError)>>>;

pub struct Simulator {
    client: SimClient,
    alloc: BufferAllocator,
    sprite_arena: BufferArena,
    sprite: Option<u8>,
    vdp1: Rc<RefCell<Vdp1Core<LoopbackEndpoint>>>,
    vdp2: Rc<RefCell<Vdp2Core<LoopbackEndpoint>>>,
    fault: Fault,
    frames: u32,
}

fn flash(pages: usize) -> Option<Box<dyn FlashDevice + Send + Sync>> {
    Some(Box::new(MemoryFlash::new(pages * FLASH_PAGE_SIZE)))
}

impl Simulator {
    pub fn new(config: &SimConfig) -> Self {
        let (mut app, vdp1_host) = loopback::link();
        let (vdp1_out, vdp2_in) = loopback::link();
        let vdp1 = Rc::new(RefCell::new(Vdp1Core::new(
            vdp1_host,
            vdp1_out,
            &config.gpu,
            flash(config.flash_pages),
        )));
        let vdp2 = Rc::new(RefCell::new(Vdp2Core::new(vdp2_in, &config.gpu, flash(config.flash_pages))));

        let fault: Fault = Rc::default();
        let (v1, v2, f) = (vdp1.clone(), vdp2.clone(), fault.clone());
        let service: Service = Rc::new(RefCell::new(move || {
            if let Err(e) = v1.borrow_mut().poll() {
                log::error!("VDP1 poll failed: {}", e);
                f.borrow_mut().get_or_insert((1, e));
            }
            if let Err(e) = v2.borrow_mut().poll() {
                log::error!("VDP2 poll failed: {}", e);
                f.borrow_mut().get_or_insert((2, e));
            }
        }));
        app.set_service(service);

        let client_config = ClientConfig {
            pool_size: config.pool_size.clamp(1, MAX_POOL_SIZE),
            ..ClientConfig::default()
        };
        log::info!(
            "simulator: pool_size={} sprite arena {:?}, {} flash pages per core",
            client_config.pool_size,
            config.sprite_arena,
            config.flash_pages
        );

        Self {
            client: SubmissionClient::new(app, client_config),
            alloc: BufferAllocator::new(
                config.gpu.ram_arena_size as u32,
                (config.flash_pages * FLASH_PAGE_SIZE) as u32,
            ),
            sprite_arena: config.sprite_arena,
            sprite: None,
            vdp1,
            vdp2,
            fault,
            frames: 0,
        }
    }

    pub fn client_mut(&mut self) -> &mut SimClient {
        &mut self.client
    }

    pub fn vdp1(&self) -> Ref<'_, Vdp1Core<LoopbackEndpoint>> {
        self.vdp1.borrow()
    }

    pub fn vdp2(&self) -> Ref<'_, Vdp2Core<LoopbackEndpoint>> {
        self.vdp2.borrow()
    }

    /// The VDP2 display buffers.
    pub fn framebuffer(&self) -> Ref<'_, FrameBuffer> {
        Ref::map(self.vdp2.borrow(), |vdp2| vdp2.framebuffer())
    }

    fn check_links(&self) -> Result<()> {
        match self.fault.borrow_mut().take() {
            Some((vdp, source)) => Err(SimError::Link { vdp, source }),
            None => Ok(()),
        }
    }

    /// Upload the demo sprite to VDP1 once. Returns its buffer id.
    pub fn load_assets(&mut self) -> Result<u8> {
        if let Some(id) = self.sprite {
            return Ok(id);
        }
        let size = demo::SPRITE_SIZE;
        let id = upload_buffer(
            &mut self.client,
            &mut self.alloc,
            Vdp::Vdp1,
            self.sprite_arena,
            &demo::sprite_texture(),
            TextureFormat::Rgb16,
            size,
            size,
        )?;
        self.check_links()?;
        let id = id as u8;
        self.sprite = Some(id);
        Ok(id)
    }

    /// Submit one demo frame and wait for it to be presented.
    pub fn run_frame(&mut self) -> Result<()> {
        let sprite = self.load_assets()?;
        let c = &mut self.client;
        c.begin_frame(ALL_TILES, CompleteFlags::FLIP_DISPLAY)?;
        c.set_default_blend(BlendMode::None);
        demo::record_scene(c, sprite, self.frames)?;
        c.end_frame(true, true)?;
        self.check_links()?;
        self.frames += 1;
        log::debug!("frame {} presented", self.frames);
        Ok(())
    }

    pub fn run(&mut self, frames: u32) -> Result<SimReport> {
        for _ in 0..frames {
            self.run_frame()?;
        }
        Ok(self.report())
    }

    pub fn report(&self) -> SimReport {
        let vdp1 = self.vdp1.borrow();
        let vdp2 = self.vdp2.borrow();
        let pages_programmed = vdp1
            .state()
            .buffers()
            .flash()
            .map(|f| f.stats().pages_programmed)
            .unwrap_or(0);
        SimReport {
            frames: self.frames,
            flips: vdp2.framebuffer().flips(),
            client: self.client.stats(),
            vdp1: vdp1.perf(),
            vdp2: vdp2.perf(),
            vdp1_pages_programmed: pages_programmed,
        }
    }

    pub fn write_ppm(&self, path: &Path) -> Result<()> {
        ppm::write_ppm(path, &self.framebuffer())?;
        log::info!("wrote {}", path.display());
        Ok(())
    }
}

/// Listing of the command stream for demo frame `frame`, as VDP1 would
/// decode it.
pub fn dump_scene(frame: u32) -> Result<String> {
    let mut buffer = CommandBuffer::new(picocom_gpu::client::DEFAULT_CMD_LIST_ALLOC_SIZE, 0);
    demo::record_scene(&mut buffer, FIRST_USER_BUFFER_ID as u8, frame)?;
    Ok(dump(buffer.stream(), &CommandTable::with_builtins()))
}
