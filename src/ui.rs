//! Call window
//!
//! A small egui window on the GLFW backend. It renders the latest
//! [`SessionSnapshot`] plus the mirrored camera self view, and turns clicks
//! into [`ShellCommand`]s for the controller. The window runs on its own
//! thread; the controller never waits on it.

use crate::sampler::PreviewFrame;
use crate::session::{ConnectionState, SessionSnapshot};
use egui::{Color32, Context, FontId, RichText, Stroke, Vec2};
use egui_glow::Painter;
use egui_window_glfw_passthrough::glfw::Context as GlfwContext;
use egui_window_glfw_passthrough::{glfw, GlfwBackend, GlfwConfig};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

const WINDOW_WIDTH: i32 = 420;
const WINDOW_HEIGHT: i32 = 560;
const SELF_VIEW_WIDTH: f32 = 200.0;

const SUNFLOWER: Color32 = Color32::from_rgb(244, 208, 63);
const SKY: Color32 = Color32::from_rgb(93, 173, 226);
const INK: Color32 = Color32::from_rgb(51, 65, 85);
const ALERT: Color32 = Color32::from_rgb(220, 88, 88);

/// User actions forwarded to the session controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellCommand {
    Start,
    Stop,
    SetMuted(bool),
    SetCameraEnabled(bool),
    /// Window closed or process exiting
    Shutdown,
}

/// What the window shows for one snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct ShellView {
    pub primary_label: &'static str,
    pub primary_command: ShellCommand,
    /// Mute and camera toggles are only live while connected
    pub controls_enabled: bool,
    pub mute_label: &'static str,
    pub mute_command: ShellCommand,
    pub camera_label: &'static str,
    pub camera_command: ShellCommand,
    pub status_line: String,
    pub status_is_error: bool,
    pub elapsed: String,
    pub live: bool,
    /// Show the local camera while connected with the camera on
    pub show_self_view: bool,
}

impl ShellView {
    pub fn from_snapshot(snapshot: &SessionSnapshot) -> Self {
        let (primary_label, primary_command) = match snapshot.state {
            ConnectionState::Idle | ConnectionState::Closed => ("Start call", ShellCommand::Start),
            ConnectionState::Connecting => ("Cancel", ShellCommand::Stop),
            ConnectionState::Open => ("End call", ShellCommand::Stop),
        };
        let (mute_label, mute_command) = if snapshot.muted {
            ("Unmute", ShellCommand::SetMuted(false))
        } else {
            ("Mute", ShellCommand::SetMuted(true))
        };
        let (camera_label, camera_command) = if snapshot.camera_enabled {
            ("Camera off", ShellCommand::SetCameraEnabled(false))
        } else {
            ("Camera on", ShellCommand::SetCameraEnabled(true))
        };

        Self {
            primary_label,
            primary_command,
            controls_enabled: snapshot.state == ConnectionState::Open,
            mute_label,
            mute_command,
            camera_label,
            camera_command,
            status_line: snapshot.status.to_string(),
            status_is_error: snapshot.status.is_error(),
            elapsed: snapshot.elapsed_display(),
            live: snapshot.state == ConnectionState::Open,
            show_self_view: snapshot.state == ConnectionState::Open && snapshot.camera_enabled,
        }
    }
}

/// The call window
pub struct UiApp {
    snapshots: watch::Receiver<SessionSnapshot>,
    previews: watch::Receiver<Option<PreviewFrame>>,
    commands: mpsc::UnboundedSender<ShellCommand>,
}

impl UiApp {
    pub fn new(
        snapshots: watch::Receiver<SessionSnapshot>,
        previews: watch::Receiver<Option<PreviewFrame>>,
        commands: mpsc::UnboundedSender<ShellCommand>,
    ) -> Self {
        Self {
            snapshots,
            previews,
            commands,
        }
    }

    fn send(&self, command: ShellCommand) {
        debug!("UI command: {:?}", command);
        if self.commands.send(command).is_err() {
            debug!("Controller is gone; dropping {:?}", command);
        }
    }

    /// Run the window until it is closed. Closing sends `Shutdown`.
    pub fn run(mut self) -> Result<(), Box<dyn std::error::Error>> {
        let config = GlfwConfig {
            window_title: "SpringBloom Live".to_string(),
            size: [WINDOW_WIDTH as u32, WINDOW_HEIGHT as u32],
            transparent_window: Some(false),
            opengl_window: Some(true),
            glfw_callback: Box::new(|glfw: &mut glfw::Glfw| {
                glfw.window_hint(glfw::WindowHint::Resizable(true));
                glfw.window_hint(glfw::WindowHint::Focused(true));
                glfw.window_hint(glfw::WindowHint::DepthBits(Some(0)));
                glfw.window_hint(glfw::WindowHint::StencilBits(Some(0)));
            }),
            window_callback: Box::new(|window| {
                window.set_size_limits(Some(WINDOW_WIDTH as u32), Some(WINDOW_HEIGHT as u32), None, None);
            }),
        };

        let mut backend = GlfwBackend::new(config);
        backend.set_passthrough(false);
        backend.window.set_all_polling(true);
        backend.window.show();

        let gl = unsafe {
            let gl = egui_glow::glow::Context::from_loader_function(|s| backend.window.get_proc_address(s) as *const _);
            Arc::new(gl)
        };
        let mut painter =
            Painter::new(gl, "", None, false).map_err(|e| format!("Failed to create painter: {}", e))?;

        let mut ctx = Context::default();
        configure_style(&mut ctx);
        let mut self_view: Option<egui::TextureHandle> = None;
        info!("Call window open");

        while !backend.window.should_close() {
            backend.glfw.poll_events();
            backend.tick();
            let raw_input = backend.take_raw_input();

            let view = ShellView::from_snapshot(&self.snapshots.borrow());
            if self.previews.has_changed().unwrap_or(false) {
                let preview = self.previews.borrow_and_update().clone();
                update_self_view(&ctx, &mut self_view, preview.as_ref());
            }
            let mut clicked: Option<ShellCommand> = None;

            for event in &raw_input.events {
                match event {
                    egui::Event::Key {
                        key: egui::Key::Escape,
                        pressed: true,
                        ..
                    } => backend.window.set_should_close(true),
                    egui::Event::Key {
                        key: egui::Key::M,
                        pressed: true,
                        modifiers,
                        ..
                    } if modifiers.shift && modifiers.ctrl && view.controls_enabled => {
                        clicked = Some(view.mute_command);
                    }
                    _ => {}
                }
            }

            unsafe {
                use egui_glow::glow::HasContext;
                painter.gl().clear_color(0.98, 0.98, 0.98, 1.0);
                painter.gl().clear(egui_glow::glow::COLOR_BUFFER_BIT);
            }

            let output = ctx.run(raw_input, |ctx| {
                if let Some(command) = draw_call_panel(ctx, &view, self_view.as_ref()) {
                    clicked = Some(command);
                }
            });

            if let Some(command) = clicked {
                self.send(command);
            }

            let clipped_primitives = ctx.tessellate(output.shapes, output.pixels_per_point);
            let (fb_width, fb_height) = backend.window.get_framebuffer_size();
            painter.paint_and_update_textures(
                [fb_width as u32, fb_height as u32],
                output.pixels_per_point,
                &clipped_primitives,
                &output.textures_delta,
            );
            backend.window.swap_buffers();

            // snapshots change at most once a second outside of user input
            std::thread::sleep(Duration::from_millis(16));
        }

        painter.destroy();
        self.send(ShellCommand::Shutdown);
        info!("Call window closed");
        Ok(())
    }
}

/// Upload the latest preview, reusing the texture between frames.
fn update_self_view(ctx: &Context, texture: &mut Option<egui::TextureHandle>, frame: Option<&PreviewFrame>) {
    let Some(frame) = frame else {
        *texture = None;
        return;
    };
    let image = egui::ColorImage::from_rgb([frame.width as usize, frame.height as usize], &frame.pixels);
    match texture {
        Some(handle) => handle.set(image, egui::TextureOptions::LINEAR),
        None => *texture = Some(ctx.load_texture("self-view", image, egui::TextureOptions::LINEAR)),
    }
}

fn draw_call_panel(ctx: &Context, view: &ShellView, self_view: Option<&egui::TextureHandle>) -> Option<ShellCommand> {
    let mut clicked = None;
    let panel = egui::Frame::none()
        .fill(Color32::from_rgb(250, 250, 250))
        .inner_margin(egui::Margin::same(24.0));

    egui::CentralPanel::default().frame(panel).show(ctx, |ui| {
        ui.vertical_centered(|ui| {
            ui.label(RichText::new("SpringBloom").font(FontId::proportional(26.0)).color(INK));
            ui.add_space(4.0);

            let status_color = if view.status_is_error { ALERT } else { INK };
            ui.horizontal(|ui| {
                let dot = if view.live { SUNFLOWER } else { Color32::LIGHT_GRAY };
                let (rect, _) = ui.allocate_exact_size(Vec2::splat(10.0), egui::Sense::hover());
                ui.painter().circle_filled(rect.center(), 5.0, dot);
                ui.label(RichText::new(&view.status_line).font(FontId::proportional(15.0)).color(status_color));
            });

            ui.add_space(16.0);
            ui.label(RichText::new(&view.elapsed).font(FontId::monospace(40.0)).color(INK));
            ui.add_space(16.0);

            if let (true, Some(texture)) = (view.show_self_view, self_view) {
                let size = texture.size_vec2();
                let scaled = size * (SELF_VIEW_WIDTH / size.x.max(1.0));
                ui.add(egui::Image::from_texture(egui::load::SizedTexture::new(texture.id(), scaled)).rounding(8.0));
                ui.label(RichText::new("You").font(FontId::proportional(12.0)).color(INK));
            }
            ui.add_space(8.0);

            ui.horizontal(|ui| {
                let mute = egui::Button::new(RichText::new(view.mute_label).font(FontId::proportional(16.0)))
                    .min_size(Vec2::new(110.0, 40.0));
                if ui.add_enabled(view.controls_enabled, mute).clicked() {
                    clicked = Some(view.mute_command);
                }
                let camera = egui::Button::new(RichText::new(view.camera_label).font(FontId::proportional(16.0)))
                    .min_size(Vec2::new(110.0, 40.0));
                if ui.add_enabled(view.controls_enabled, camera).clicked() {
                    clicked = Some(view.camera_command);
                }
            });

            ui.add_space(16.0);
            let primary_fill = if view.live { ALERT } else { SKY };
            let primary = egui::Button::new(
                RichText::new(view.primary_label)
                    .font(FontId::proportional(18.0))
                    .color(Color32::WHITE),
            )
            .fill(primary_fill)
            .min_size(Vec2::new(232.0, 48.0));
            if ui.add(primary).clicked() {
                clicked = Some(view.primary_command);
            }
        });
    });

    clicked
}

/// Configure a light, rounded theme
fn configure_style(ctx: &mut Context) {
    let mut style = (*ctx.style()).clone();
    style.visuals.dark_mode = false;
    style.visuals.panel_fill = Color32::from_rgb(250, 250, 250);

    style.visuals.widgets.noninteractive.fg_stroke = Stroke::new(1.0, INK);
    style.visuals.widgets.inactive.fg_stroke = Stroke::new(1.0, INK);
    style.visuals.widgets.inactive.bg_fill = Color32::from_rgb(254, 249, 231);
    style.visuals.widgets.inactive.weak_bg_fill = Color32::from_rgb(254, 249, 231);
    style.visuals.widgets.inactive.bg_stroke = Stroke::new(1.0, SUNFLOWER);
    style.visuals.widgets.hovered.bg_stroke = Stroke::new(1.5, SUNFLOWER);

    let mut widgets = style.visuals.widgets.clone();
    widgets.noninteractive.rounding = egui::Rounding::from(12.0);
    widgets.inactive.rounding = egui::Rounding::from(12.0);
    widgets.hovered.rounding = egui::Rounding::from(12.0);
    widgets.active.rounding = egui::Rounding::from(12.0);
    style.visuals.widgets = widgets;

    style.spacing.item_spacing = Vec2::new(12.0, 8.0);
    style.spacing.button_padding = Vec2::new(12.0, 6.0);
    ctx.set_style(style);
}

/// Launch the call window in a separate thread
pub fn launch_ui(
    snapshots: watch::Receiver<SessionSnapshot>,
    previews: watch::Receiver<Option<PreviewFrame>>,
    commands: mpsc::UnboundedSender<ShellCommand>,
) -> JoinHandle<()> {
    let app = UiApp::new(snapshots, previews, commands.clone());
    std::thread::spawn(move || {
        if let Err(e) = app.run() {
            error!("UI error: {}", e);
            // without a window there is nothing left to drive the session
            let _ = commands.send(ShellCommand::Shutdown);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;

    fn snapshot(state: ConnectionState) -> SessionSnapshot {
        SessionSnapshot {
            state,
            ..Default::default()
        }
    }

    #[test]
    fn idle_offers_start_with_controls_disabled() {
        let view = ShellView::from_snapshot(&SessionSnapshot::default());
        assert_eq!(view.primary_command, ShellCommand::Start);
        assert!(!view.controls_enabled);
        assert!(!view.show_self_view);
        assert_eq!(view.status_line, "Ready to talk");
        assert_eq!(view.elapsed, "00:00");
    }

    #[test]
    fn open_session_offers_end_and_toggles() {
        let mut open = snapshot(ConnectionState::Open);
        open.status = SessionStatus::Connected;
        open.elapsed_secs = 125;

        let view = ShellView::from_snapshot(&open);
        assert_eq!(view.primary_label, "End call");
        assert_eq!(view.primary_command, ShellCommand::Stop);
        assert!(view.controls_enabled);
        assert_eq!(view.mute_command, ShellCommand::SetMuted(true));
        assert_eq!(view.camera_command, ShellCommand::SetCameraEnabled(false));
        assert_eq!(view.elapsed, "02:05");
    }

    #[test]
    fn toggles_flip_current_flags() {
        let mut open = snapshot(ConnectionState::Open);
        open.muted = true;
        open.camera_enabled = false;

        let view = ShellView::from_snapshot(&open);
        assert_eq!(view.mute_label, "Unmute");
        assert_eq!(view.mute_command, ShellCommand::SetMuted(false));
        assert_eq!(view.camera_command, ShellCommand::SetCameraEnabled(true));
    }

    #[test]
    fn self_view_shows_only_while_live_with_camera_on() {
        let open = snapshot(ConnectionState::Open);
        assert!(ShellView::from_snapshot(&open).show_self_view);

        let mut camera_off = open.clone();
        camera_off.camera_enabled = false;
        assert!(!ShellView::from_snapshot(&camera_off).show_self_view);

        let connecting = snapshot(ConnectionState::Connecting);
        assert!(!ShellView::from_snapshot(&connecting).show_self_view);
    }

    #[test]
    fn connecting_can_be_cancelled() {
        let view = ShellView::from_snapshot(&snapshot(ConnectionState::Connecting));
        assert_eq!(view.primary_command, ShellCommand::Stop);
        assert!(!view.controls_enabled);
    }

    #[test]
    fn errors_are_flagged_and_restartable() {
        let mut closed = snapshot(ConnectionState::Closed);
        closed.status = SessionStatus::DeviceError("no camera".to_string());

        let view = ShellView::from_snapshot(&closed);
        assert!(view.status_is_error);
        assert!(view.status_line.contains("no camera"));
        assert_eq!(view.primary_command, ShellCommand::Start);
    }
}
