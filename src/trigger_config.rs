use std::str::FromStr;

use crate::capture::{CaptureConfigError, Channel};
use crate::command::{KitchenSinkA, SpockOption};
use crate::profile::HardwareProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    Rising,
    Falling,
    Above,
    Below,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Rising => "rising",
            TriggerType::Falling => "falling",
            TriggerType::Above => "above",
            TriggerType::Below => "below",
        }
    }

    /// The comparator fires on the inverted signal.
    pub fn is_inverted(self) -> bool {
        matches!(self, TriggerType::Falling | TriggerType::Below)
    }

    /// Samples the comparator must hold its state before the trigger fires.
    ///
    /// Edge triggers need 4 samples on the BitScope while level triggers
    /// fire at once. Observed device behavior, not part of the VM protocol.
    pub fn intro(self) -> u32 {
        match self {
            TriggerType::Rising | TriggerType::Falling => 4,
            TriggerType::Above | TriggerType::Below => 0,
        }
    }
}

impl FromStr for TriggerType {
    type Err = CaptureConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rising" => Ok(TriggerType::Rising),
            "falling" => Ok(TriggerType::Falling),
            "above" => Ok(TriggerType::Above),
            "below" => Ok(TriggerType::Below),
            _ => Err(CaptureConfigError::UnknownTriggerType(s.to_string())),
        }
    }
}

/// When a capture starts.
///
/// `level` is in volts, or normalized to `[0, 1]` for raw captures.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub channel: Option<Channel>,
    pub level: f64,
    pub trigger_type: TriggerType,
}

impl Default for Trigger {
    fn default() -> Self {
        Self {
            channel: None,
            level: 0.0,
            trigger_type: TriggerType::Rising,
        }
    }
}

#[derive(Debug)]
pub struct TriggerBuilder {
    channel: Option<Channel>,
    level: f64,
}

impl TriggerBuilder {
    pub fn on_channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn rising_edge(self) -> Trigger {
        self.build(TriggerType::Rising)
    }

    pub fn falling_edge(self) -> Trigger {
        self.build(TriggerType::Falling)
    }

    pub fn above(self) -> Trigger {
        self.build(TriggerType::Above)
    }

    pub fn below(self) -> Trigger {
        self.build(TriggerType::Below)
    }

    pub fn build(self, trigger_type: TriggerType) -> Trigger {
        Trigger {
            channel: self.channel,
            level: self.level,
            trigger_type,
        }
    }
}

impl Trigger {
    pub fn start_capturing_when(level: f64) -> TriggerBuilder {
        TriggerBuilder {
            channel: None,
            level,
        }
    }
}

/// Register-level form of a [`Trigger`].
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerSettings {
    pub channel: Channel,
    pub spock_option: SpockOption,
    pub kitchen_sink_a: KitchenSinkA,
    pub intro: u32,
    /// Comparator level normalized to the trigger range.
    pub level: f64,
}

impl TriggerSettings {
    /// `channels` are the captured channels in request order; an unset
    /// trigger channel defaults to the first of them.
    pub fn encode(
        trigger: &Trigger,
        channels: &[Channel],
        raw: bool,
        profile: &HardwareProfile,
    ) -> Result<Self, CaptureConfigError> {
        let channel = match trigger.channel {
            Some(channel) if channels.contains(&channel) => channel,
            Some(channel) => return Err(CaptureConfigError::InvalidTriggerChannel { channel }),
            None => *channels.first().ok_or(CaptureConfigError::NoChannels)?,
        };

        let mut spock_option = SpockOption::TRIGGER_HARDWARE_COMPARATOR;
        let kitchen_sink_a = match channel {
            Channel::A => {
                spock_option |= SpockOption::TRIGGER_SOURCE_A;
                KitchenSinkA::CHANNEL_A_COMPARATOR_ENABLE
            }
            Channel::B => {
                spock_option |= SpockOption::TRIGGER_SOURCE_B;
                KitchenSinkA::CHANNEL_B_COMPARATOR_ENABLE
            }
        };
        if trigger.trigger_type.is_inverted() {
            spock_option |= SpockOption::TRIGGER_INVERT;
        }

        let level = if raw {
            trigger.level
        } else {
            (trigger.level - profile.trigger_low) / (profile.trigger_high - profile.trigger_low)
        };

        Ok(Self {
            channel,
            spock_option,
            kitchen_sink_a,
            intro: trigger.trigger_type.intro(),
            level,
        })
    }
}
