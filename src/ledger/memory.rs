use async_trait::async_trait;
use dashmap::DashMap;

use crate::ledger::{LedgerError, Period, UsageLedger, UsageRecord};

#[derive(Default)]
pub struct MemoryLedger {
    partitions: DashMap<(String, Period), Vec<UsageRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageLedger for MemoryLedger {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn append(&self, client_id: &str, record: UsageRecord) -> Result<(), LedgerError> {
        record.validate(client_id)?;
        self.partitions
            .entry((client_id.to_string(), record.period()))
            .or_default()
            .push(record);
        Ok(())
    }

    async fn read_partition(
        &self,
        client_id: &str,
        period: Period,
    ) -> Result<Option<Vec<UsageRecord>>, LedgerError> {
        Ok(self
            .partitions
            .get(&(client_id.to_string(), period))
            .map(|records| records.value().clone()))
    }
}
