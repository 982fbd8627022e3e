//! Wi-Fi link supervision with statum state machine
//!
//! The link moves `Down -> Associating -> Up`, and back to `Associating` whenever an
//! association check fails. Association is retried forever; the only way out of a
//! radio that never comes back is the watchdog.

use super::{WifiCredentials, WifiRadio};
use crate::config::WifiSettings;
use statum::{machine, state};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[state]
#[derive(Debug, Clone)]
pub enum LinkState {
    Down,
    Associating,
    Up,
}

#[machine]
#[derive(Debug)]
pub struct WifiLink<S: LinkState> {
    credentials: WifiCredentials,
    poll_interval: Duration,
    // Polls between radio resets while associating, 0 disables resets
    rebegin_after: u32,
    attempts: u32,
}

impl WifiLink<Down> {
    pub fn create(credentials: WifiCredentials, settings: &WifiSettings) -> Self {
        Self::new(
            credentials,
            settings.poll_interval(),
            settings.rebegin_after_polls,
            0,
        )
    }

    /// Issues the association request and transitions to Associating
    pub async fn start<R: WifiRadio>(mut self, radio: &mut R) -> WifiLink<Associating> {
        info!("Connecting to Wi-Fi network {}", self.credentials.ssid);
        if let Err(e) = radio.begin(&self.credentials).await {
            warn!("Association request failed: {}", e);
        }
        self.attempts = 0;
        self.transition()
    }
}

impl WifiLink<Associating> {
    /// Polls the radio until it reports association. Never gives up.
    pub async fn associate<R: WifiRadio>(mut self, radio: &mut R) -> WifiLink<Up> {
        loop {
            if radio.is_associated().await {
                info!(
                    "Wi-Fi connected to {} after {} polls",
                    self.credentials.ssid, self.attempts
                );
                self.attempts = 0;
                return self.transition();
            }

            self.attempts += 1;
            if self.rebegin_after > 0 && self.attempts % self.rebegin_after == 0 {
                warn!(
                    "Still not associated after {} polls, resetting radio",
                    self.attempts
                );
                reassociate(radio, &self.credentials).await;
            } else {
                debug!("Waiting for association ({} polls)", self.attempts);
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

impl WifiLink<Up> {
    /// Disconnects and asks again after a detected loss
    pub async fn recover<R: WifiRadio>(self, radio: &mut R) -> WifiLink<Associating> {
        warn!("Wi-Fi link to {} lost, reconnecting", self.credentials.ssid);
        reassociate(radio, &self.credentials).await;
        self.transition()
    }
}

async fn reassociate<R: WifiRadio>(radio: &mut R, credentials: &WifiCredentials) {
    if let Err(e) = radio.disconnect().await {
        debug!("Radio disconnect failed: {}", e);
    }
    if let Err(e) = radio.begin(credentials).await {
        warn!("Association request failed: {}", e);
    }
}

/// Link state as seen from outside the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Down,
    Associating,
    Up,
}

/// Outcome of [`NetworkSupervisor::ensure_up`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// The link was up before the call and still is
    Stable,
    /// The link came up during the call, anything built on top of it is stale
    Recovered,
}

#[derive(Debug)]
enum Link {
    Down(WifiLink<Down>),
    Associating(WifiLink<Associating>),
    Up(WifiLink<Up>),
}

pub struct NetworkSupervisor<R: WifiRadio> {
    radio: R,
    credentials: WifiCredentials,
    settings: WifiSettings,
    // None only while a transition is in flight
    link: Option<Link>,
    last_check: Option<Instant>,
}

impl<R: WifiRadio> NetworkSupervisor<R> {
    pub fn new(radio: R, credentials: WifiCredentials, settings: WifiSettings) -> Self {
        let link = WifiLink::create(credentials.clone(), &settings);
        Self {
            radio,
            credentials,
            settings,
            link: Some(Link::Down(link)),
            last_check: None,
        }
    }

    pub fn state(&self) -> NetworkState {
        match &self.link {
            Some(Link::Up(_)) => NetworkState::Up,
            Some(Link::Associating(_)) => NetworkState::Associating,
            Some(Link::Down(_)) | None => NetworkState::Down,
        }
    }

    pub fn is_up(&self) -> bool {
        self.state() == NetworkState::Up
    }

    /// Forces the next [`ensure_up`](Self::ensure_up) to query the radio.
    pub fn verify_soon(&mut self) {
        self.last_check = None;
    }

    /// Drives the link to Up, re-checking an established link at most once per
    /// `link_check_secs`.
    pub async fn ensure_up(&mut self) -> LinkStatus {
        let link = match self.link.take() {
            Some(link) => link,
            // An earlier call was cancelled mid-transition
            None => Link::Down(WifiLink::create(self.credentials.clone(), &self.settings)),
        };

        let (up, status) = match link {
            Link::Up(up) => {
                if !self.check_due() {
                    self.link = Some(Link::Up(up));
                    return LinkStatus::Stable;
                }
                self.last_check = Some(Instant::now());
                if self.radio.is_associated().await {
                    self.link = Some(Link::Up(up));
                    return LinkStatus::Stable;
                }
                let associating = up.recover(&mut self.radio).await;
                (associating.associate(&mut self.radio).await, LinkStatus::Recovered)
            }
            Link::Associating(associating) => (
                associating.associate(&mut self.radio).await,
                LinkStatus::Recovered,
            ),
            Link::Down(down) => {
                let associating = down.start(&mut self.radio).await;
                (associating.associate(&mut self.radio).await, LinkStatus::Recovered)
            }
        };

        self.last_check = Some(Instant::now());
        self.link = Some(Link::Up(up));
        status
    }

    fn check_due(&self) -> bool {
        match self.last_check {
            Some(at) => at.elapsed() >= self.settings.link_check(),
            None => true,
        }
    }
}
