//! Compute Playground - GPU 管线实验平台
//!
//! # 使用方法
//!
//! ```bash
//! # 使用配置文件
//! cargo run
//!
//! # 软件设备跑 10 帧后退出
//! cargo run -- --headless --frames 10
//!
//! # 强制传统 PSO 路径，并启用 PIX 抓帧（F1）
//! cargo run -- --dx12 --legacy --capture pix
//! ```
//!
//! # 按键
//!
//! - `Esc`：退出
//! - `F1`：抓取下一帧
//! - `F11`：切换全屏

use anyhow::Context;
use tracing::{error, info};

use compute_playground::core::config::{Config, GraphicsBackendKind};
use compute_playground::core::{log, PlaygroundError};
use compute_playground::gfx::headless::{HeadlessBackend, HeadlessCompiler, HeadlessPresenter};
use compute_playground::renderer::shader::CompileOptions;
use compute_playground::renderer::{ContextDesc, DeviceContext, FrameDriver};

/// 软件设备未指定帧数时渲染的帧数
const DEFAULT_HEADLESS_FRAMES: u64 = 3;

fn main() {
    // 1. 加载配置（在初始化日志之前）
    let mut config = Config::from_file_or_default("config.toml");

    // 2. 应用命令行参数
    config.apply_args(std::env::args());

    // 3. 验证配置
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    // 4. 初始化日志系统
    let log_file = config
        .logging
        .file_output
        .then_some(config.logging.log_file.as_str());
    if let Err(e) = log::init_logger(config.logging.level, config.logging.file_output, log_file) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }
    info!(version = env!("CARGO_PKG_VERSION"), "Compute Playground starting...");
    info!(
        backend = config.graphics.backend.name(),
        width = config.window.width,
        height = config.window.height,
        pipeline = ?config.graphics.pipeline_path,
        "Graphics configuration"
    );

    let result = match config.graphics.backend {
        GraphicsBackendKind::Headless => run_headless(&config),
        GraphicsBackendKind::Dx12 => run_windowed(&config),
    };

    if let Err(err) = result {
        match err.downcast_ref::<PlaygroundError>() {
            Some(playground) => playground.report(),
            None => error!("{:#}", err),
        }
        eprintln!("Fatal: {:#}", err);
        std::process::exit(1);
    }
    info!("Compute Playground exited cleanly");
}

fn compile_options(config: &Config) -> CompileOptions {
    CompileOptions::new(config.shader.debug, config.shader.directory.clone())
}

/// 在软件设备上渲染固定帧数
fn run_headless(config: &Config) -> anyhow::Result<()> {
    let mut context = DeviceContext::new(HeadlessBackend::new(), &ContextDesc::from_config(&config.graphics))?;
    let presenter = HeadlessPresenter::new(
        &mut context,
        config.graphics.back_buffer_count as usize,
        config.window.width,
        config.window.height,
    )?;
    let compiler = HeadlessCompiler::new(compile_options(config));
    let mut driver =
        FrameDriver::new(context, presenter, &compiler, config).context("failed to create frame driver")?;

    let frames = match config.run.max_frames {
        0 => DEFAULT_HEADLESS_FRAMES,
        n => n,
    };
    for _ in 0..frames {
        driver.render_frame()?;
    }

    if let Some(sample) = driver.last_readback() {
        info!(
            frame = sample.frame,
            first_pixel = sample.first_pixel,
            graph = ?sample.graph_counter,
            "Last readback"
        );
    }
    let errors = driver.context().backend().validation_errors().len();
    driver.shutdown()?;

    if errors > 0 {
        anyhow::bail!("headless device reported {} validation errors", errors);
    }
    Ok(())
}

#[cfg(not(target_os = "windows"))]
fn run_windowed(_config: &Config) -> anyhow::Result<()> {
    Err(PlaygroundError::Initialization("DirectX 12 is only available on Windows".to_string()).into())
}

#[cfg(target_os = "windows")]
fn run_windowed(config: &Config) -> anyhow::Result<()> {
    use compute_playground::core::event::{FrameEvent, KeyCode, LoopControl};
    use compute_playground::gfx::dx12::capture::preload_capture_library;
    use compute_playground::gfx::dx12::debug::report_live_objects;
    use compute_playground::gfx::dx12::{Dx12Backend, Dx12Presenter, DxcCompiler};
    use winit::dpi::PhysicalSize;
    use winit::event::{ElementState, Event, WindowEvent};
    use winit::event_loop::{ControlFlow, EventLoop};
    use winit::keyboard::{KeyCode as WinitKey, PhysicalKey};
    use winit::platform::scancode::PhysicalKeyExtScancode;
    use winit::window::WindowBuilder;

    fn frame_key(key: PhysicalKey) -> KeyCode {
        match key {
            PhysicalKey::Code(WinitKey::Escape) => KeyCode::Escape,
            PhysicalKey::Code(WinitKey::F1) => KeyCode::F1,
            PhysicalKey::Code(WinitKey::F11) => KeyCode::F11,
            other => KeyCode::Other(other.to_scancode().unwrap_or(0)),
        }
    }

    // 抓帧工具必须在设备创建前注入
    preload_capture_library(&config.capture);

    let event_loop = EventLoop::new().context("failed to create event loop")?;
    let window = WindowBuilder::new()
        .with_title(config.window.title.as_str())
        .with_inner_size(PhysicalSize::new(config.window.width, config.window.height))
        .with_resizable(config.window.resizable)
        .build(&event_loop)
        .context("failed to create window")?;
    let size = window.inner_size();

    let frames = config.graphics.back_buffer_count as usize;
    let mut context = DeviceContext::new(
        Dx12Backend::new(&config.debug, frames)?,
        &ContextDesc::from_config(&config.graphics),
    )?;
    let presenter = Dx12Presenter::new(&mut context, &window, frames, size.width, size.height)?;
    let compiler = DxcCompiler::new(compile_options(config))?;
    let mut driver = Some(FrameDriver::new(context, presenter, &compiler, config)?);

    info!("Entering main loop...");
    let max_frames = config.run.max_frames;
    let mut failure: Option<PlaygroundError> = None;

    event_loop.set_control_flow(ControlFlow::Poll);
    event_loop
        .run(|event, target| {
            let frame_event = match event {
                Event::WindowEvent { event, .. } => match event {
                    WindowEvent::CloseRequested => Some(FrameEvent::CloseRequested),
                    WindowEvent::Resized(size) => Some(FrameEvent::Resize {
                        width: size.width,
                        height: size.height,
                    }),
                    WindowEvent::KeyboardInput { event, .. }
                        if event.state == ElementState::Pressed && !event.repeat =>
                    {
                        Some(FrameEvent::KeyDown(frame_key(event.physical_key)))
                    }
                    WindowEvent::RedrawRequested => {
                        if let Some(driver) = driver.as_mut() {
                            if let Err(err) = driver.render_frame() {
                                failure = Some(err);
                                target.exit();
                            } else if max_frames > 0 && driver.frame_number() >= max_frames {
                                info!(frames = max_frames, "Frame limit reached");
                                target.exit();
                            }
                        }
                        None
                    }
                    _ => None,
                },
                Event::AboutToWait => {
                    window.request_redraw();
                    None
                }
                Event::LoopExiting => {
                    if let Some(driver) = driver.take() {
                        if let Err(err) = driver.shutdown() {
                            failure.get_or_insert(err);
                        }
                    }
                    None
                }
                _ => None,
            };

            if let (Some(frame_event), Some(driver)) = (frame_event, driver.as_mut()) {
                match driver.handle_event(frame_event) {
                    Ok(LoopControl::Continue) => {}
                    Ok(LoopControl::Exit) => {
                        info!("Close requested, shutting down...");
                        target.exit();
                    }
                    Err(err) => {
                        failure = Some(err);
                        target.exit();
                    }
                }
            }
        })
        .context("event loop terminated abnormally")?;

    // 设备已随帧驱动一起释放，此时仍存活的对象即为泄漏
    if config.debug.validation_layer {
        report_live_objects();
    }

    match failure {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}
