use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use companion_nav::MissionItem;
use companion_proto::Position;
use mavlink::common::{
    MavCmd, MavFrame, MavMessage, MavMissionResult, MavResult, COMMAND_LONG_DATA,
    MISSION_COUNT_DATA, MISSION_ITEM_INT_DATA, SYS_STATUS_DATA,
};
use mavlink::{MavConnection, MavHeader};
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::autodetect::{autodetect_fc, default_candidate_bauds, default_candidate_devs};
use crate::{FcConfig, FlightDriver, TelemetryStream};

type Conn = Arc<dyn MavConnection<MavMessage> + Send + Sync>;

struct Link {
    conn: Conn,
    sequence: AtomicU8,
    sys_id: u8,
    comp_id: u8,
    target_sys: u8,
    target_comp: u8,
    messages: broadcast::Sender<MavMessage>,
}

impl Link {
    fn send(&self, msg: MavMessage) -> Result<()> {
        let hdr = MavHeader {
            system_id: self.sys_id,
            component_id: self.comp_id,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };
        self.conn.send(&hdr, &msg).context("mavlink send")?;
        Ok(())
    }

    fn command(&self, command: MavCmd, params: [f32; 7]) -> Result<()> {
        let cmd = COMMAND_LONG_DATA {
            target_system: self.target_sys,
            target_component: self.target_comp,
            command,
            confirmation: 0,
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            param5: params[4],
            param6: params[5],
            param7: params[6],
        };
        self.send(MavMessage::COMMAND_LONG(cmd))
    }
}

/// Autopilot driver over MAVLink (ArduPilot / PX4).
///
/// A reader thread owns `recv()`, publishes position and battery into watch
/// channels and fans every message out on a broadcast channel that the
/// request/acknowledge exchanges below listen on.
pub struct MavlinkDriver {
    cfg: FcConfig,
    link: OnceLock<Arc<Link>>,
    position: watch::Sender<Option<Position>>,
    battery: watch::Sender<Option<f64>>,
}

impl MavlinkDriver {
    pub fn new(cfg: FcConfig) -> Self {
        let (position, _) = watch::channel(None);
        let (battery, _) = watch::channel(None);
        Self {
            cfg,
            link: OnceLock::new(),
            position,
            battery,
        }
    }

    fn link(&self) -> Result<Arc<Link>> {
        self.link.get().cloned().context("fc: not connected")
    }

    fn step_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.cfg.upload_timeout_s.max(0.1))
    }

    async fn resolve_url(&self) -> Result<String> {
        if !self.cfg.autodetect {
            return self.cfg.url.clone().context("fc.url missing (autodetect=false)");
        }
        let devs = self.cfg.candidate_devs.clone().unwrap_or_else(default_candidate_devs);
        let bauds = self.cfg.candidate_bauds.clone().unwrap_or_else(default_candidate_bauds);
        let hb_timeout = Duration::from_millis(self.cfg.heartbeat_timeout_ms);
        let res = tokio::task::spawn_blocking(move || autodetect_fc(&devs, &bauds, hb_timeout))
            .await
            .context("fc autodetect task")??;
        res.chosen.context("fc autodetect failed: no heartbeat found")
    }

    async fn command_acked(&self, link: &Link, command: MavCmd, params: [f32; 7]) -> Result<()> {
        let mut rx = link.messages.subscribe();
        link.command(command, params)?;
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(MavMessage::COMMAND_ACK(ack)) if ack.command == command => {
                        anyhow::ensure!(
                            ack.result == MavResult::MAV_RESULT_ACCEPTED,
                            "{:?} refused: {:?}",
                            command,
                            ack.result
                        );
                        return Ok(());
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => anyhow::bail!("fc: link closed"),
                }
            }
        };
        timeout(self.step_timeout(), wait)
            .await
            .with_context(|| format!("{:?}: no ack", command))?
    }

    async fn upload(&self, link: &Link, items: &[MissionItem]) -> Result<()> {
        let count = mission_len(items)?;
        let mut rx = link.messages.subscribe();
        link.send(MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
            target_system: link.target_sys,
            target_component: link.target_comp,
            count,
            ..Default::default()
        }))?;

        loop {
            let msg = match timeout(self.step_timeout(), rx.recv()).await {
                Err(_) => anyhow::bail!("mission upload timed out"),
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => anyhow::bail!("fc: link closed"),
                Ok(Ok(m)) => m,
            };
            let seq = match msg {
                MavMessage::MISSION_REQUEST_INT(r) => r.seq,
                MavMessage::MISSION_REQUEST(r) => r.seq,
                MavMessage::MISSION_ACK(ack) => {
                    anyhow::ensure!(
                        ack.mavtype == MavMissionResult::MAV_MISSION_ACCEPTED,
                        "mission rejected: {:?}",
                        ack.mavtype
                    );
                    info!("fc: mission uploaded ({} items)", items.len());
                    return Ok(());
                }
                _ => continue,
            };
            let item = items
                .get(seq as usize)
                .with_context(|| format!("autopilot requested item {} of {}", seq, items.len()))?;
            debug!("fc: sending item {}", seq);
            link.send(MavMessage::MISSION_ITEM_INT(to_mission_item(link, seq, item)))?;
        }
    }
}

fn to_mission_item(link: &Link, seq: u16, item: &MissionItem) -> MISSION_ITEM_INT_DATA {
    MISSION_ITEM_INT_DATA {
        target_system: link.target_sys,
        target_component: link.target_comp,
        seq,
        frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT,
        command: MavCmd::MAV_CMD_NAV_WAYPOINT,
        current: u8::from(seq == 0),
        autocontinue: 1,
        // hold time; the last item is a full stop
        param1: if item.fly_through { 0.0 } else { 1.0 },
        param2: item.acceptance_radius_m,
        param3: 0.0,
        param4: f32::NAN,
        x: (item.position.lat * 1e7).round() as i32,
        y: (item.position.lon * 1e7).round() as i32,
        z: item.altitude_m,
        ..Default::default()
    }
}

/// Item count as carried by MISSION_COUNT.
fn mission_len(items: &[MissionItem]) -> Result<u16> {
    u16::try_from(items.len()).map_err(|_| anyhow::anyhow!("mission too long for mavlink: {} items", items.len()))
}

fn battery_fraction(status: &SYS_STATUS_DATA) -> Option<f64> {
    // -1 means the autopilot does not estimate it
    (0..=100)
        .contains(&status.battery_remaining)
        .then(|| status.battery_remaining as f64 / 100.0)
}

#[async_trait]
impl FlightDriver for MavlinkDriver {
    async fn connect(&self) -> Result<()> {
        if self.link.get().is_some() {
            return Ok(());
        }
        let url = self.resolve_url().await?;
        let conn: Conn = {
            let connect_url = url.clone();
            tokio::task::spawn_blocking(move || mavlink::connect::<MavMessage>(&connect_url))
                .await
                .context("fc connect task")?
                .with_context(|| format!("mavlink connect {}", url))?
                .into()
        };
        let (messages, _) = broadcast::channel(256);
        let link = Arc::new(Link {
            conn: conn.clone(),
            sequence: AtomicU8::new(0),
            sys_id: self.cfg.sys_id,
            comp_id: self.cfg.comp_id,
            target_sys: self.cfg.target_sys,
            target_comp: self.cfg.target_comp,
            messages: messages.clone(),
        });
        if self.link.set(link).is_err() {
            return Ok(());
        }

        let position = self.position.clone();
        let battery = self.battery.clone();
        std::thread::Builder::new()
            .name("mavlink-rx".into())
            .spawn(move || loop {
                match conn.recv() {
                    Ok((_hdr, msg)) => {
                        match &msg {
                            MavMessage::GLOBAL_POSITION_INT(p) => {
                                position.send_replace(Some(Position::new(p.lat as f64 / 1e7, p.lon as f64 / 1e7)));
                            }
                            MavMessage::SYS_STATUS(s) => {
                                if let Some(f) = battery_fraction(s) {
                                    battery.send_replace(Some(f));
                                }
                            }
                            _ => {}
                        }
                        let _ = messages.send(msg);
                    }
                    Err(e) => {
                        debug!("fc: recv error: {}", e);
                        std::thread::sleep(Duration::from_millis(10));
                    }
                }
            })
            .context("spawn mavlink reader")?;

        info!("fc: connected via {}", url);
        Ok(())
    }

    fn telemetry_position(&self) -> TelemetryStream<Position> {
        Box::pin(WatchStream::new(self.position.subscribe()).filter_map(|v| v))
    }

    fn telemetry_battery(&self) -> TelemetryStream<f64> {
        Box::pin(WatchStream::new(self.battery.subscribe()).filter_map(|v| v))
    }

    async fn execute_mission(&self, items: Vec<MissionItem>) -> Result<()> {
        anyhow::ensure!(!items.is_empty(), "empty mission");
        let link = self.link()?;
        let last = mission_len(&items)? - 1;

        self.upload(&link, &items).await?;
        self.arm().await?;
        if let Some(cruise) = items.iter().find(|i| i.speed_mps > 0.0).map(|i| i.speed_mps) {
            // ground speed
            if let Err(e) = self
                .command_acked(&link, MavCmd::MAV_CMD_DO_CHANGE_SPEED, [1.0, cruise, -1.0, 0.0, 0.0, 0.0, 0.0])
                .await
            {
                warn!("fc: speed change not applied: {:#}", e);
            }
        }

        let mut rx = link.messages.subscribe();
        self.command_acked(&link, MavCmd::MAV_CMD_MISSION_START, [0.0, last as f32, 0.0, 0.0, 0.0, 0.0, 0.0])
            .await?;
        info!("fc: mission started ({} items)", items.len());

        loop {
            match rx.recv().await {
                Ok(MavMessage::MISSION_ITEM_REACHED(r)) => {
                    info!("fc: item {:02}/{:02} reached", r.seq + 1, items.len());
                    if r.seq >= last {
                        return Ok(());
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => anyhow::bail!("fc: link closed mid-mission"),
            }
        }
    }

    async fn land(&self) -> Result<()> {
        let link = self.link()?;
        info!("fc: sending LAND");
        self.command_acked(&link, MavCmd::MAV_CMD_NAV_LAND, [0.0, 0.0, 0.0, f32::NAN, 0.0, 0.0, 0.0])
            .await
    }

    async fn arm(&self) -> Result<()> {
        let link = self.link()?;
        info!("fc: arming");
        self.command_acked(&link, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
            .await
    }

    async fn disarm(&self) -> Result<()> {
        let link = self.link()?;
        info!("fc: disarming");
        self.command_acked(&link, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use companion_nav::ItemParams;

    #[test]
    fn battery_remaining_mapping() {
        let mut s = SYS_STATUS_DATA::default();
        s.battery_remaining = 73;
        assert_eq!(battery_fraction(&s), Some(0.73));
        s.battery_remaining = -1;
        assert_eq!(battery_fraction(&s), None);
    }

    #[test]
    fn mission_length_must_fit_u16() {
        let item = MissionItem {
            position: Position::new(51.0, 14.0),
            altitude_m: 30.0,
            speed_mps: 0.0,
            fly_through: true,
            acceptance_radius_m: 2.0,
        };
        assert_eq!(mission_len(&vec![item; 3]).unwrap(), 3);
        assert_eq!(mission_len(&vec![item; u16::MAX as usize]).unwrap(), u16::MAX);
        assert!(mission_len(&vec![item; u16::MAX as usize + 1]).is_err());
    }

    #[tokio::test]
    async fn commands_require_connection() {
        let drv = MavlinkDriver::new(FcConfig { url: Some("udpin:127.0.0.1:0".into()), ..Default::default() });
        assert!(drv.land().await.is_err());
        assert!(drv.disarm().await.is_err());
    }

    #[tokio::test]
    async fn missing_url_is_an_error() {
        let drv = MavlinkDriver::new(FcConfig::default());
        let err = drv.connect().await.unwrap_err();
        assert!(format!("{:#}", err).contains("fc.url missing"));
    }

    #[test]
    fn item_encoding() {
        let (messages, _) = broadcast::channel(1);
        let conn: Conn = mavlink::connect::<MavMessage>("udpin:127.0.0.1:0").unwrap().into();
        let link = Link {
            conn,
            sequence: AtomicU8::new(0),
            sys_id: 1,
            comp_id: 191,
            target_sys: 1,
            target_comp: 1,
            messages,
        };
        let p = ItemParams::default();
        let item = MissionItem {
            position: Position::new(51.7661740, 14.3231520),
            altitude_m: p.altitude_m,
            speed_mps: 0.0,
            fly_through: false,
            acceptance_radius_m: p.acceptance_radius_m,
        };
        let m = to_mission_item(&link, 2, &item);
        assert_eq!(m.seq, 2);
        assert_eq!(m.current, 0);
        assert_eq!(m.x, 517_661_740);
        assert_eq!(m.y, 143_231_520);
        assert_eq!(m.z, 30.0);
        assert_eq!(m.param1, 1.0);
        assert_eq!(m.param2, 2.0);
    }
}
