//! BlueZ LE discovery adapter.
//!
//! Runs discovery on the default adapter with duplicate data enabled and
//! turns every manufacturer-data update into a [`RawAdvertisement`]. Adapter
//! loss and power changes are reported as [`RadioState`] events and
//! discovery is restarted with backoff.

use std::{
   collections::{HashMap, hash_map::Entry},
   pin::pin,
   time::Duration,
};

use bluer::{
   Adapter, AdapterEvent, AdapterProperty, Address, DeviceEvent, DeviceProperty,
   DiscoveryFilter, DiscoveryTransport, Session,
};
use futures::stream::StreamExt;
use log::{debug, info, warn};
use rand::Rng;
use smol_str::{SmolStr, ToSmolStr};
use tokio::{
   sync::mpsc,
   task::JoinHandle,
   time::{self, Instant},
};

use crate::{
   airpods::filter::RawAdvertisement,
   error::{Result, TrackerError},
};

/// Maximum delay between discovery restarts
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Availability of the Bluetooth radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioState {
   Available,
   Unavailable(SmolStr),
}

impl RadioState {
   pub const fn is_available(&self) -> bool {
      matches!(self, Self::Available)
   }

   pub fn reason(&self) -> &str {
      match self {
         Self::Available => "",
         Self::Unavailable(reason) => reason,
      }
   }
}

/// Events delivered to the manager.
#[derive(Debug, Clone)]
pub enum ScannerEvent {
   Advertisement(RawAdvertisement),
   Radio(RadioState),
}

/// Spawns the discovery task. It runs until the receiving side is dropped.
pub fn spawn(tx: mpsc::Sender<ScannerEvent>) -> JoinHandle<()> {
   tokio::spawn(async move {
      let mut retry_count = 0u32;
      loop {
         let err = match scan(&tx, &mut retry_count).await {
            Ok(()) => return,
            Err(e) => e,
         };
         let reason = match err {
            TrackerError::RadioUnavailable(reason) => reason,
            other => other.to_smolstr(),
         };
         if tx
            .send(ScannerEvent::Radio(RadioState::Unavailable(reason)))
            .await
            .is_err()
         {
            return;
         }

         retry_count += 1;
         let delay = calc_retry_delay(retry_count);
         warn!("Restarting discovery in {delay:?}");
         time::sleep(delay).await;
      }
   })
}

/// Runs one discovery session. Returns `Ok` only when the receiver is gone.
async fn scan(tx: &mpsc::Sender<ScannerEvent>, retry_count: &mut u32) -> Result<()> {
   let session = Session::new().await?;
   let adapter = session.default_adapter().await?;
   let name = adapter.name().to_smolstr();
   if !adapter.is_powered().await? {
      return Err(TrackerError::RadioUnavailable(
         format!("adapter {name} is powered off").into(),
      ));
   }

   adapter
      .set_discovery_filter(DiscoveryFilter {
         transport: DiscoveryTransport::Le,
         duplicate_data: true,
         ..Default::default()
      })
      .await?;
   let mut discovery = pin!(adapter.discover_devices().await?);
   info!("LE discovery running on {name}");
   *retry_count = 0;
   if tx
      .send(ScannerEvent::Radio(RadioState::Available))
      .await
      .is_err()
   {
      return Ok(());
   }

   let mut watchers: HashMap<Address, JoinHandle<()>> = HashMap::new();
   let result = loop {
      let Some(event) = discovery.next().await else {
         break Err(TrackerError::RadioUnavailable(
            format!("discovery on {name} stopped").into(),
         ));
      };
      if tx.is_closed() {
         break Ok(());
      }
      match event {
         AdapterEvent::DeviceAdded(addr) => {
            if let Entry::Vacant(slot) = watchers.entry(addr) {
               match watch_device(&adapter, addr, tx.clone()) {
                  Ok(handle) => {
                     slot.insert(handle);
                  },
                  Err(e) => debug!("{addr}: cannot watch device: {e}"),
               }
            }
         },
         AdapterEvent::DeviceRemoved(addr) => {
            if let Some(handle) = watchers.remove(&addr) {
               handle.abort();
            }
         },
         AdapterEvent::PropertyChanged(AdapterProperty::Powered(false)) => {
            break Err(TrackerError::RadioUnavailable(
               format!("adapter {name} was powered off").into(),
            ));
         },
         _ => {},
      }
   };

   for (_, handle) in watchers.drain() {
      handle.abort();
   }
   result
}

/// Forwards manufacturer-data updates of one device until it goes away.
fn watch_device(
   adapter: &Adapter,
   addr: Address,
   tx: mpsc::Sender<ScannerEvent>,
) -> Result<JoinHandle<()>> {
   let device = adapter.device(addr)?;
   Ok(tokio::spawn(async move {
      let Ok(events) = device.events().await else {
         return;
      };
      let mut events = pin!(events);
      let mut rssi = device.rssi().await.ok().flatten();
      if let Ok(Some(data)) = device.manufacturer_data().await
         && !forward(&tx, addr, rssi, &data).await
      {
         return;
      }

      while let Some(event) = events.next().await {
         match event {
            DeviceEvent::PropertyChanged(DeviceProperty::Rssi(value)) => rssi = Some(value),
            DeviceEvent::PropertyChanged(DeviceProperty::ManufacturerData(data)) => {
               if !forward(&tx, addr, rssi, &data).await {
                  return;
               }
            },
            _ => {},
         }
      }
   }))
}

/// Sends one advertisement per company entry. Returns false once the
/// receiver is gone.
async fn forward(
   tx: &mpsc::Sender<ScannerEvent>,
   addr: Address,
   rssi: Option<i16>,
   data: &HashMap<u16, Vec<u8>>,
) -> bool {
   for adv in advertisements(addr, rssi, data, Instant::now().into_std()) {
      if tx.send(ScannerEvent::Advertisement(adv)).await.is_err() {
         return false;
      }
   }
   true
}

fn advertisements(
   addr: Address,
   rssi: Option<i16>,
   data: &HashMap<u16, Vec<u8>>,
   now: std::time::Instant,
) -> impl Iterator<Item = RawAdvertisement> + '_ {
   data
      .iter()
      .map(move |(&cid, payload)| RawAdvertisement::new(addr, rssi, cid, payload, now))
}

fn calc_retry_delay(retry_count: u32) -> Duration {
   let base_delay = Duration::from_secs(2);
   let exponential = base_delay * (1 << retry_count.min(5));
   let delay = exponential.min(MAX_RETRY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::airpods::protocol::APPLE_CID;

   #[test]
   fn test_one_advertisement_per_company() {
      let addr = Address::new([1, 2, 3, 4, 5, 6]);
      let data = HashMap::from([(APPLE_CID, vec![0x07, 0x19]), (0x0006, vec![0x01])]);
      let now = std::time::Instant::now();

      let mut advs: Vec<_> = advertisements(addr, Some(-60), &data, now).collect();
      advs.sort_by_key(|a| a.company_id);
      assert_eq!(advs.len(), 2);
      assert_eq!(advs[0].company_id, 0x0006);
      assert_eq!(advs[1].company_id, APPLE_CID);
      assert_eq!(advs[1].payload.as_slice(), &[0x07, 0x19]);
      assert!(advs.iter().all(|a| a.address == addr && a.rssi == Some(-60)));
   }

   #[test]
   fn test_retry_delay_is_bounded() {
      let first = calc_retry_delay(1);
      assert!(first >= Duration::from_secs(4) && first < Duration::from_secs(5));
      for n in [6, 10, 100] {
         let delay = calc_retry_delay(n);
         assert!(delay >= MAX_RETRY_DELAY && delay < MAX_RETRY_DELAY + Duration::from_secs(1));
      }
   }

   #[test]
   fn test_radio_state() {
      assert!(RadioState::Available.is_available());
      let off = RadioState::Unavailable("adapter hci0 is powered off".into());
      assert!(!off.is_available());
      assert_eq!(off.reason(), "adapter hci0 is powered off");
   }
}
