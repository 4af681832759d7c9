//! Build-time drill configuration
//!
//! Reads drill timings from JSON and generates the `CONFIG` static of the
//! firmware library. Missing fields take the firmware defaults.

use std::{path::Path, fs::File, io::{Write, BufReader}};

use anyhow::{bail, Context};
use proc_macro2::TokenStream;
use quote::{quote, ToTokens, TokenStreamExt};
use serde::{Serialize, Deserialize};
use schemars::{JsonSchema, schema_for, schema::RootSchema};

#[derive(Serialize, Deserialize, JsonSchema, Debug, PartialEq, Clone, Copy)]
pub struct Color {
    r: u8,
    g: u8,
    b: u8,
}

impl Color {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl ToTokens for Color {
    fn to_tokens(&self, tokens: &mut TokenStream) {
        let Self { r, g, b } = self;
        tokens.append_all(quote! {
            rgb::RGB8 { r: #r, g: #g, b: #b }
        });
    }
}

/// Drill timings in milliseconds
#[derive(Serialize, Deserialize, JsonSchema, Debug, PartialEq, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct DrillConfig {
    beacon_interval_ms: u32,
    discovery_poll_ms: u32,
    ping_delay_ms: u32,
    ping_count: u8,
    ping_interval_ms: u32,
    pong_timeout_ms: u32,
    rounds: u8,
    arm_timeout_ms: u32,
    /// Bit 0: light, bit 1: sound
    feedback_mode: u8,
    inter_round_ms: u32,
    join_settle_ms: u32,
    round_margin_ms: u32,
    heartbeat_ms: u32,
    restart_pause_ms: u32,
    peer_round_poll_ms: u32,
    participant_poll_ms: u32,
    local_round_poll_ms: u32,
    feedback_ms: u32,
    broadcast_send_timeout_ms: u32,
    unicast_send_timeout_ms: u32,
    armed_color: Color,
    hit_color: Color,
    miss_color: Color,
}

impl Default for DrillConfig {
    fn default() -> Self {
        Self {
            beacon_interval_ms: 2000,
            discovery_poll_ms: 500,
            ping_delay_ms: 3000,
            ping_count: 10,
            ping_interval_ms: 500,
            pong_timeout_ms: 2000,
            rounds: 10,
            arm_timeout_ms: 3000,
            feedback_mode: 0x03,
            inter_round_ms: 1000,
            join_settle_ms: 2000,
            round_margin_ms: 2000,
            heartbeat_ms: 15000,
            restart_pause_ms: 5000,
            peer_round_poll_ms: 100,
            participant_poll_ms: 100,
            local_round_poll_ms: 10,
            feedback_ms: 200,
            broadcast_send_timeout_ms: 200,
            unicast_send_timeout_ms: 1000,
            armed_color: Color::new(0, 255, 0),
            hit_color: Color::new(255, 255, 255),
            miss_color: Color::new(255, 0, 0),
        }
    }
}

impl ToTokens for DrillConfig {
    fn to_tokens(&self, tokens: &mut TokenStream) {
        let Self {
            beacon_interval_ms, discovery_poll_ms, ping_delay_ms, ping_count,
            ping_interval_ms, pong_timeout_ms, rounds, arm_timeout_ms, feedback_mode,
            inter_round_ms, join_settle_ms, round_margin_ms, heartbeat_ms,
            restart_pause_ms, peer_round_poll_ms, participant_poll_ms,
            local_round_poll_ms, feedback_ms, broadcast_send_timeout_ms,
            unicast_send_timeout_ms, armed_color, hit_color, miss_color,
        } = self;
        tokens.append_all(quote! {
            crate::config::Timing {
                beacon_interval_ms: #beacon_interval_ms,
                discovery_poll_ms: #discovery_poll_ms,
                ping_delay_ms: #ping_delay_ms,
                ping_count: #ping_count,
                ping_interval_ms: #ping_interval_ms,
                pong_timeout_ms: #pong_timeout_ms,
                rounds: #rounds,
                arm_timeout_ms: #arm_timeout_ms,
                feedback_mode: #feedback_mode,
                inter_round_ms: #inter_round_ms,
                join_settle_ms: #join_settle_ms,
                round_margin_ms: #round_margin_ms,
                heartbeat_ms: #heartbeat_ms,
                restart_pause_ms: #restart_pause_ms,
                peer_round_poll_ms: #peer_round_poll_ms,
                participant_poll_ms: #participant_poll_ms,
                local_round_poll_ms: #local_round_poll_ms,
                feedback_ms: #feedback_ms,
                broadcast_send_timeout_ms: #broadcast_send_timeout_ms,
                unicast_send_timeout_ms: #unicast_send_timeout_ms,
                armed_color: #armed_color,
                hit_color: #hit_color,
                miss_color: #miss_color,
            }
        })
    }
}

impl DrillConfig {
    /// Same rules as the firmware applies at runtime, checked before generating code
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rounds == 0 {
            bail!("rounds must be at least 1");
        }
        if self.ping_count == 0 {
            bail!("ping_count must be at least 1");
        }
        let timeouts = [
            ("beacon_interval_ms", self.beacon_interval_ms),
            ("discovery_poll_ms", self.discovery_poll_ms),
            ("pong_timeout_ms", self.pong_timeout_ms),
            ("arm_timeout_ms", self.arm_timeout_ms),
            ("heartbeat_ms", self.heartbeat_ms),
            ("peer_round_poll_ms", self.peer_round_poll_ms),
            ("participant_poll_ms", self.participant_poll_ms),
            ("broadcast_send_timeout_ms", self.broadcast_send_timeout_ms),
            ("unicast_send_timeout_ms", self.unicast_send_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, t)| *t == 0) {
            bail!("{} must not be 0", name);
        }
        if self.feedback_ms >= self.inter_round_ms {
            bail!("feedback_ms ({}) must be shorter than inter_round_ms ({})",
                self.feedback_ms, self.inter_round_ms);
        }
        Ok(())
    }

    fn file_tokens(&self) -> TokenStream {
        quote! {
            pub static CONFIG: crate::config::Timing = #self;
        }
    }

    fn to_string_pretty(&self) -> anyhow::Result<String> {
        unparse(self.file_tokens())
    }

    pub fn to_file(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;
        let code = self.to_string_pretty()?;
        File::create(path)?.write_all(code.as_bytes())?;
        Ok(())
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let config = serde_json::from_reader(reader)?;
        Ok(config)
    }

    pub fn schema() -> RootSchema {
        schema_for!(Self)
    }

    pub fn schema_to_file(path: &Path) -> anyhow::Result<()> {
        let schema = serde_json::to_string_pretty(&Self::schema())?;
        File::create(path)?.write_all(schema.as_bytes())?;
        Ok(())
    }
}

/// Format tokens of a whole source file
fn unparse(tokens: TokenStream) -> anyhow::Result<String> {
    let code = tokens.to_string();
    let parsed = syn::parse_file(&code)
        .context(format!("Failed to parse:\n{}", code))?;
    Ok(prettyplease::unparse(&parsed))
}
