//! Parsing of `pactl list sinks` output.

use btaudio_core::SinkState;

use crate::client::SinkInfo;

/// Parse the sink blocks out of `pactl list sinks`.
///
/// Only the fields the daemon acts on are extracted: name, state,
/// flat volume percentage, and mute.
pub(crate) fn parse_sinks(output: &str) -> Vec<SinkInfo> {
    let mut sinks = Vec::new();
    let mut current: Option<SinkInfo> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("Sink #") {
            if let Some(sink) = current.take() {
                if !sink.name.is_empty() {
                    sinks.push(sink);
                }
            }
            current = Some(SinkInfo::default());
            continue;
        }
        let Some(sink) = current.as_mut() else {
            continue;
        };
        if let Some(rest) = trimmed.strip_prefix("Name:") {
            sink.name = rest.trim().to_string();
        } else if let Some(rest) = trimmed.strip_prefix("State:") {
            sink.state = match rest.trim() {
                "RUNNING" => SinkState::Running,
                "IDLE" => SinkState::Idle,
                "SUSPENDED" => SinkState::Suspended,
                _ => SinkState::Idle,
            };
        } else if let Some(rest) = trimmed.strip_prefix("Mute:") {
            sink.mute = rest.trim() == "yes";
        } else if let Some(rest) = trimmed.strip_prefix("Volume:") {
            // e.g. "front-left: 42598 /  65% / -11.23 dB,   front-right: ..."
            if let Some(pct) = rest
                .split('/')
                .map(str::trim)
                .find_map(|part| part.strip_suffix('%'))
            {
                sink.volume_pct = pct.trim().parse().unwrap_or(sink.volume_pct);
            }
        }
    }
    if let Some(sink) = current.take() {
        if !sink.name.is_empty() {
            sinks.push(sink);
        }
    }
    sinks
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Sink #1
\tState: SUSPENDED
\tName: alsa_output.pci-0000_00_1f.3.analog-stereo
\tVolume: front-left: 65536 / 100% / 0.00 dB,   front-right: 65536 / 100% / 0.00 dB
\tMute: no
Sink #7
\tState: RUNNING
\tName: bluez_sink.AA_BB_CC_DD_EE_01.a2dp_sink
\tDescription: Kitchen Speaker
\tVolume: front-left: 42598 / 65% / -11.23 dB,   front-right: 42598 / 65% / -11.23 dB
\tMute: no
Sink #9
\tState: IDLE
\tName: bluez_sink.AA_BB_CC_DD_EE_02.a2dp_sink
\tVolume: front-left: 65536 / 100% / 0.00 dB
\tMute: yes
";

    #[test]
    fn parses_all_blocks() {
        let sinks = parse_sinks(SAMPLE);
        assert_eq!(sinks.len(), 3);
        assert_eq!(sinks[0].state, SinkState::Suspended);
        assert_eq!(sinks[1].name, "bluez_sink.AA_BB_CC_DD_EE_01.a2dp_sink");
        assert_eq!(sinks[1].state, SinkState::Running);
        assert_eq!(sinks[1].volume_pct, 65);
        assert!(!sinks[1].mute);
        assert_eq!(sinks[2].state, SinkState::Idle);
        assert!(sinks[2].mute);
    }

    #[test]
    fn tolerates_unknown_lines_and_empty_input() {
        assert!(parse_sinks("").is_empty());
        let sinks = parse_sinks("Sink #3\n\tFormats:\n\t\tpcm\n\tName: x\n");
        assert_eq!(sinks.len(), 1);
        assert_eq!(sinks[0].name, "x");
    }
}
