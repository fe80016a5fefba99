//! SDP Zeilenmodell
//!
//! Der Signaling-Server erwartet ICE Candidates direkt im SDP (kein Trickle ICE).
//! Statt String-Splicing wird das SDP als geordnete Liste typisierter Zeilen
//! gehalten, aus der Candidates strukturiert entnommen und eingefügt werden.

use serde::{Deserialize, Serialize};
use std::fmt;

const CANDIDATE_PREFIX: &str = "a=candidate:";
const END_OF_CANDIDATES: &str = "a=end-of-candidates";
const MID_PREFIX: &str = "a=mid:";

// ============================================================================
// TYPES
// ============================================================================

/// Rolle einer Session Description im Offer/Answer-Austausch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpRole {
    Offer,
    Answer,
}

impl fmt::Display for SdpRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpRole::Offer => f.write_str("offer"),
            SdpRole::Answer => f.write_str("answer"),
        }
    }
}

/// Eine einzelne SDP-Zeile
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdpLine {
    /// `m=` Zeile, beginnt eine Media Section
    Media(String),
    /// `a=candidate:...`, gespeichert ohne das `a=` Präfix
    Candidate(String),
    /// `a=end-of-candidates`
    EndOfCandidates,
    /// Alle übrigen Zeilen, unverändert
    Other(String),
}

impl SdpLine {
    /// Klassifiziert eine Zeile (ohne Zeilenende)
    pub fn parse(line: &str) -> Self {
        if line.starts_with("m=") {
            SdpLine::Media(line.to_string())
        } else if line.starts_with(CANDIDATE_PREFIX) {
            SdpLine::Candidate(line[2..].to_string())
        } else if line == END_OF_CANDIDATES {
            SdpLine::EndOfCandidates
        } else {
            SdpLine::Other(line.to_string())
        }
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, SdpLine::Candidate(_))
    }

    fn mid(&self) -> Option<&str> {
        match self {
            SdpLine::Other(text) => text.strip_prefix(MID_PREFIX),
            _ => None,
        }
    }
}

impl fmt::Display for SdpLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpLine::Media(text) | SdpLine::Other(text) => f.write_str(text),
            SdpLine::Candidate(candidate) => write!(f, "a={}", candidate),
            SdpLine::EndOfCandidates => f.write_str(END_OF_CANDIDATES),
        }
    }
}

/// ICE Candidate wie er vom lokalen ICE Agent geliefert
/// oder aus einem Remote-SDP extrahiert wird
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// `candidate:...` ohne `a=` Präfix
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mline_index: None,
            sdp_mid: None,
        }
    }

    pub fn with_mline_index(mut self, index: u16) -> Self {
        self.sdp_mline_index = Some(index);
        self
    }

    pub fn with_mid(mut self, mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(mid.into());
        self
    }
}

// ============================================================================
// SESSION DESCRIPTION
// ============================================================================

/// SDP als geordnete Zeilenliste mit Rolle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    role: SdpRole,
    lines: Vec<SdpLine>,
}

impl SessionDescription {
    /// Parst SDP-Text. Leere Zeilen werden verworfen, `\r\n` und `\n`
    /// werden beide als Zeilenende akzeptiert.
    pub fn parse(text: &str, role: SdpRole) -> Self {
        let lines = text
            .split('\n')
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty())
            .map(SdpLine::parse)
            .collect();

        Self { role, lines }
    }

    pub fn from_lines(lines: Vec<SdpLine>, role: SdpRole) -> Self {
        Self { role, lines }
    }

    pub fn role(&self) -> SdpRole {
        self.role
    }

    pub fn lines(&self) -> &[SdpLine] {
        &self.lines
    }

    /// Anzahl der eingebetteten Candidates
    pub fn candidate_count(&self) -> usize {
        self.lines.iter().filter(|line| line.is_candidate()).count()
    }

    /// Anzahl der Media Sections (`m=` Zeilen)
    pub fn media_count(&self) -> usize {
        self.lines
            .iter()
            .filter(|line| matches!(line, SdpLine::Media(_)))
            .count()
    }

    /// Serialisiert das SDP mit `\r\n` nach jeder Zeile
    pub fn to_sdp(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(&line.to_string());
            out.push_str("\r\n");
        }
        out
    }

    /// Trennt Candidates vom restlichen SDP.
    ///
    /// `a=end-of-candidates` wird verworfen. Jeder Candidate bekommt den
    /// Index und die `a=mid` seiner Media Section mit; Candidates auf
    /// Session-Ebene haben beides nicht.
    pub fn split_candidates(&self) -> (SessionDescription, Vec<IceCandidate>) {
        let mids = self.section_mids();
        let mut kept = Vec::with_capacity(self.lines.len());
        let mut candidates = Vec::new();
        let mut section: Option<usize> = None;

        for line in &self.lines {
            match line {
                SdpLine::Media(_) => {
                    section = Some(section.map_or(0, |s| s + 1));
                    kept.push(line.clone());
                }
                SdpLine::Candidate(text) => {
                    let mut candidate = IceCandidate::new(text.clone());
                    if let Some(index) = section {
                        candidate.sdp_mline_index = u16::try_from(index).ok();
                        candidate.sdp_mid = mids.get(index).cloned().flatten();
                    }
                    candidates.push(candidate);
                }
                SdpLine::EndOfCandidates => {}
                SdpLine::Other(_) => kept.push(line.clone()),
            }
        }

        (Self::from_lines(kept, self.role), candidates)
    }

    /// Fügt Candidates in ihre Media Section ein.
    ///
    /// Ziel-Section: `sdp_mline_index`, sonst passende `a=mid`, sonst die
    /// erste Section (BUNDLE). Candidates werden am Ende der Section vor
    /// einem vorhandenen `a=end-of-candidates` eingefügt; fehlt der Marker,
    /// wird er angehängt. Jeder Candidate wird genau einmal eingefügt, auch
    /// wenn die Zeile schon vorkommt. Ohne Candidates bleibt das SDP unverändert.
    pub fn with_candidates(&self, candidates: &[IceCandidate]) -> SessionDescription {
        if candidates.is_empty() {
            return self.clone();
        }

        let (header, mut sections) = self.sections();
        if sections.is_empty() {
            // Kein m= vorhanden: Candidates an die Session-Ebene hängen
            let mut lines = header;
            Self::insert_into(&mut lines, candidates.iter());
            return Self::from_lines(lines, self.role);
        }

        let mids: Vec<Option<String>> = sections
            .iter()
            .map(|lines| lines.iter().find_map(|l| l.mid().map(str::to_string)))
            .collect();

        let mut per_section: Vec<Vec<&IceCandidate>> = vec![Vec::new(); sections.len()];
        for candidate in candidates {
            let target = candidate
                .sdp_mline_index
                .map(usize::from)
                .filter(|index| *index < sections.len())
                .or_else(|| {
                    candidate.sdp_mid.as_ref().and_then(|mid| {
                        mids.iter().position(|m| m.as_deref() == Some(mid.as_str()))
                    })
                })
                .unwrap_or(0);
            per_section[target].push(candidate);
        }

        for (lines, pending) in sections.iter_mut().zip(per_section) {
            if !pending.is_empty() {
                Self::insert_into(lines, pending.into_iter());
            }
        }

        let mut lines = header;
        lines.extend(sections.into_iter().flatten());
        Self::from_lines(lines, self.role)
    }

    fn insert_into<'a>(lines: &mut Vec<SdpLine>, candidates: impl Iterator<Item = &'a IceCandidate>) {
        let new_lines: Vec<SdpLine> = candidates
            .map(|candidate| SdpLine::Candidate(candidate.candidate.clone()))
            .collect();
        if new_lines.is_empty() {
            return;
        }

        match lines.iter().position(|l| *l == SdpLine::EndOfCandidates) {
            Some(marker) => {
                for (offset, line) in new_lines.into_iter().enumerate() {
                    lines.insert(marker + offset, line);
                }
            }
            None => {
                lines.extend(new_lines);
                lines.push(SdpLine::EndOfCandidates);
            }
        }
    }

    /// Session-Header und Media Sections (jeweils inkl. `m=` Zeile)
    fn sections(&self) -> (Vec<SdpLine>, Vec<Vec<SdpLine>>) {
        let mut header = Vec::new();
        let mut sections: Vec<Vec<SdpLine>> = Vec::new();

        for line in &self.lines {
            match (line, sections.last_mut()) {
                (SdpLine::Media(_), _) => sections.push(vec![line.clone()]),
                (_, Some(section)) => section.push(line.clone()),
                (_, None) => header.push(line.clone()),
            }
        }

        (header, sections)
    }

    fn section_mids(&self) -> Vec<Option<String>> {
        self.sections()
            .1
            .iter()
            .map(|lines| lines.iter().find_map(|l| l.mid().map(str::to_string)))
            .collect()
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sdp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 4215775240449105457 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=sendrecv\r\n";

    const REMOTE_WITH_CANDIDATES: &str = "v=0\r\n\
o=FreeSWITCH 1700000000 1700000001 IN IP4 10.0.0.5\r\n\
s=FreeSWITCH\r\n\
t=0 0\r\n\
m=audio 20000 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 10.0.0.5\r\n\
a=mid:0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=candidate:1 1 udp 2130706431 10.0.0.5 20000 typ host\r\n\
a=candidate:2 1 udp 1694498815 203.0.113.7 20000 typ srflx raddr 10.0.0.5 rport 20000\r\n\
a=candidate:3 1 tcp 1518280447 10.0.0.5 9 typ host tcptype active\r\n\
a=end-of-candidates\r\n\
a=sendrecv\r\n\
m=video 0 UDP/TLS/RTP/SAVPF 96\r\n\
a=mid:1\r\n\
a=inactive\r\n";

    #[test]
    fn test_parse_classifies_lines() {
        let sdp = SessionDescription::parse(REMOTE_WITH_CANDIDATES, SdpRole::Answer);
        assert_eq!(sdp.candidate_count(), 3);
        assert_eq!(sdp.media_count(), 2);
        assert!(sdp.lines().contains(&SdpLine::EndOfCandidates));
        assert_eq!(
            sdp.lines()[8],
            SdpLine::Candidate("candidate:1 1 udp 2130706431 10.0.0.5 20000 typ host".into())
        );
    }

    #[test]
    fn test_parse_accepts_bare_newlines() {
        let sdp = SessionDescription::parse("v=0\ns=-\n\nm=audio 9 RTP/AVP 0\n", SdpRole::Offer);
        assert_eq!(sdp.lines().len(), 3);
        assert_eq!(sdp.to_sdp(), "v=0\r\ns=-\r\nm=audio 9 RTP/AVP 0\r\n");
    }

    #[test]
    fn test_serialization_is_byte_identical_for_crlf_input() {
        let sdp = SessionDescription::parse(OFFER, SdpRole::Offer);
        assert_eq!(sdp.to_sdp(), OFFER);
    }

    #[test]
    fn test_split_extracts_candidates_with_section_info() {
        let sdp = SessionDescription::parse(REMOTE_WITH_CANDIDATES, SdpRole::Answer);
        let (stripped, candidates) = sdp.split_candidates();

        assert_eq!(candidates.len(), 3);
        assert_eq!(stripped.candidate_count(), 0);
        assert!(!stripped.lines().contains(&SdpLine::EndOfCandidates));
        for candidate in &candidates {
            assert!(candidate.candidate.starts_with("candidate:"));
            assert_eq!(candidate.sdp_mline_index, Some(0));
            assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        }

        let non_candidate: Vec<&SdpLine> = sdp
            .lines()
            .iter()
            .filter(|l| !l.is_candidate() && **l != SdpLine::EndOfCandidates)
            .collect();
        let stripped_lines: Vec<&SdpLine> = stripped.lines().iter().collect();
        assert_eq!(non_candidate, stripped_lines);
    }

    #[test]
    fn test_split_and_rejoin_preserves_candidate_count_and_order() {
        let sdp = SessionDescription::parse(REMOTE_WITH_CANDIDATES, SdpRole::Answer);
        let (stripped, candidates) = sdp.split_candidates();
        let rejoined = stripped.with_candidates(&candidates);

        assert_eq!(rejoined.candidate_count(), 3);
        let structural = |l: &&SdpLine| !l.is_candidate() && **l != SdpLine::EndOfCandidates;
        let before: Vec<_> = sdp.lines().iter().filter(structural).collect();
        let after: Vec<_> = rejoined.lines().iter().filter(structural).collect();
        assert_eq!(before, after);
        assert_eq!(rejoined.media_count(), 2);
    }

    #[test]
    fn test_round_trip_is_line_identical_when_candidates_close_the_section() {
        let text = "v=0\r\n\
s=-\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=mid:0\r\n\
a=candidate:1 1 udp 2130706431 192.168.1.2 50000 typ host\r\n\
a=candidate:2 1 udp 1694498815 198.51.100.1 50000 typ srflx raddr 192.168.1.2 rport 50000\r\n\
a=end-of-candidates\r\n";
        let sdp = SessionDescription::parse(text, SdpRole::Offer);
        let (stripped, candidates) = sdp.split_candidates();
        assert_eq!(stripped.with_candidates(&candidates), sdp);
        assert_eq!(stripped.with_candidates(&candidates).to_sdp(), text);
    }

    #[test]
    fn test_round_trip_without_candidates_is_identity() {
        let sdp = SessionDescription::parse(OFFER, SdpRole::Offer);
        let (stripped, candidates) = sdp.split_candidates();
        assert!(candidates.is_empty());
        assert_eq!(stripped.with_candidates(&candidates), sdp);
    }

    #[test]
    fn test_with_candidates_appends_marker_at_section_end() {
        let sdp = SessionDescription::parse(OFFER, SdpRole::Offer);
        let merged = sdp.with_candidates(&[
            IceCandidate::new("candidate:1 1 udp 2130706431 192.168.1.2 50000 typ host")
                .with_mline_index(0),
            IceCandidate::new("candidate:2 1 udp 1694498815 198.51.100.1 50000 typ srflx")
                .with_mid("0"),
        ]);

        let text = merged.to_sdp();
        assert!(text.ends_with(
            "a=sendrecv\r\n\
a=candidate:1 1 udp 2130706431 192.168.1.2 50000 typ host\r\n\
a=candidate:2 1 udp 1694498815 198.51.100.1 50000 typ srflx\r\n\
a=end-of-candidates\r\n"
        ));
        assert_eq!(merged.candidate_count(), 2);
    }

    #[test]
    fn test_repeated_candidate_lines_survive_split_and_rejoin() {
        let text = "v=0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=mid:0\r\n\
a=candidate:1 1 udp 2130706431 192.168.1.2 50000 typ host\r\n\
a=candidate:1 1 udp 2130706431 192.168.1.2 50000 typ host\r\n\
a=end-of-candidates\r\n";
        let sdp = SessionDescription::parse(text, SdpRole::Answer);
        let (stripped, candidates) = sdp.split_candidates();
        assert_eq!(candidates.len(), 2);

        let rejoined = stripped.with_candidates(&candidates);
        assert_eq!(rejoined.candidate_count(), 2);
        assert_eq!(rejoined.to_sdp(), text);
    }

    #[test]
    fn test_with_candidates_routes_by_mid() {
        let sdp = SessionDescription::parse(
            "v=0\r\nm=audio 9 RTP/AVP 0\r\na=mid:a\r\nm=video 9 RTP/AVP 96\r\na=mid:v\r\n",
            SdpRole::Offer,
        );
        let merged = sdp.with_candidates(&[IceCandidate::new("candidate:9 1 udp 1 10.1.1.1 9 typ host").with_mid("v")]);
        let lines: Vec<String> = merged.lines().iter().map(|l| l.to_string()).collect();
        assert_eq!(
            lines,
            vec![
                "v=0",
                "m=audio 9 RTP/AVP 0",
                "a=mid:a",
                "m=video 9 RTP/AVP 96",
                "a=mid:v",
                "a=candidate:9 1 udp 1 10.1.1.1 9 typ host",
                "a=end-of-candidates",
            ]
        );
    }
}
