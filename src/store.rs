use std::future::Future;

use alloy::primitives::{keccak256, Address, U256};
use anyhow::{anyhow, bail, Context, Result};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Row};
use uuid::Uuid;

const MIGRATOR: Migrator = sqlx::migrate!("./migrations");

// Matches Go's binary.MaxVarintLen64. The uvarint is written at the start of
// the buffer and the remainder stays zero, so every upkeep id hashes a fixed
// 10-byte prefix.
const UVARINT_PAD_LEN: usize = 10;

/// A keeper registry contract being watched on behalf of one keeper operator.
///
/// Created with only `address`, `from` and `job_id` set; the synchronizer
/// fills in the config and membership fields on its first pass.
#[derive(Clone, Debug, PartialEq)]
pub struct Registry {
    pub id: i64,
    pub reference_id: Uuid,
    pub job_id: Uuid,
    pub address: Address,
    pub from: Address,
    pub check_gas: u32,
    pub block_count_per_turn: u32,
    pub keeper_index: u32,
    pub num_keepers: u32,
}

impl Registry {
    pub fn new(address: Address, from: Address, job_id: Uuid) -> Self {
        Self {
            id: 0,
            reference_id: Uuid::new_v4(),
            job_id,
            address,
            from,
            check_gas: 0,
            block_count_per_turn: 0,
            keeper_index: 0,
            num_keepers: 0,
        }
    }
}

/// One upkeep registered on a registry contract.
#[derive(Clone, Debug, PartialEq)]
pub struct Registration {
    pub id: i64,
    pub registry_id: i64,
    pub upkeep_id: u64,
    pub execute_gas: u32,
    pub check_data: Vec<u8>,
    pub positioning_constant: u32,
}

impl Registration {
    /// Turn-taking predicate: true iff `block_number` is a turn boundary for
    /// the registry and the rotation for this upkeep lands on our keeper
    /// index at that turn.
    ///
    /// Registries that have never completed a sync (`num_keepers == 0` or
    /// `block_count_per_turn == 0`) are never eligible.
    pub fn eligible_at(&self, registry: &Registry, block_number: u64) -> bool {
        let block_count_per_turn = registry.block_count_per_turn as u64;
        if block_count_per_turn == 0 || registry.num_keepers == 0 {
            return false;
        }
        if block_number % block_count_per_turn != 0 {
            return false;
        }
        let turn = block_number / block_count_per_turn;
        let rotation = (self.positioning_constant as u64 + turn) % registry.num_keepers as u64;
        registry.keeper_index as u64 == rotation
    }
}

/// An upkeep joined with its parent registry, as returned by the eligibility
/// query.
#[derive(Clone, Debug, PartialEq)]
pub struct EligibleUpkeep {
    pub upkeep: Registration,
    pub registry: Registry,
}

fn uvarint_padded(mut value: u64) -> [u8; UVARINT_PAD_LEN] {
    let mut buf = [0u8; UVARINT_PAD_LEN];
    let mut idx = 0;
    while value >= 0x80 {
        buf[idx] = (value as u8) | 0x80;
        value >>= 7;
        idx += 1;
    }
    buf[idx] = value as u8;
    buf
}

/// Deterministic rotation offset for an upkeep:
/// `keccak256(uvarint(upkeep_id) ‖ registry_address) mod num_keepers`, with
/// the uvarint zero-padded to its maximum length. All keepers must compute
/// this identically or they disagree on whose turn it is.
pub fn calc_positioning_constant(
    upkeep_id: u64,
    registry_address: Address,
    num_keepers: u32,
) -> Result<u32> {
    if num_keepers == 0 {
        bail!("cannot calculate positioning constant with zero keepers");
    }

    let mut bytes = Vec::with_capacity(UVARINT_PAD_LEN + Address::len_bytes());
    bytes.extend_from_slice(&uvarint_padded(upkeep_id));
    bytes.extend_from_slice(registry_address.as_slice());

    let hash = keccak256(&bytes);
    let constant = U256::from_be_bytes(hash.0) % U256::from(num_keepers);

    Ok(constant.to::<u32>())
}

/// Durable mapping of registries and their upkeeps.
///
/// Every operation is atomic at the row-set level; the synchronizer and the
/// executer call into the same store concurrently.
pub trait KeeperStore {
    fn registries(&self) -> impl Future<Output = Result<Vec<Registry>>> + Send;

    /// Inserts a brand-new registry row. Errors if the address is already
    /// registered; an existing row is never touched.
    fn create_registry(&self, registry: &Registry) -> impl Future<Output = Result<Registry>> + Send;

    /// Insert if new, otherwise overwrite the config and membership fields of
    /// the row with the same address. Returns the stored row with its id.
    /// This is the sync path; registration goes through `create_registry`.
    fn upsert_registry(&self, registry: &Registry) -> impl Future<Output = Result<Registry>> + Send;

    /// Deletes the registry and, by cascade, all of its upkeeps.
    fn delete_registry_by_job_id(&self, job_id: Uuid)
        -> impl Future<Output = Result<u64>> + Send;

    /// On `(registry_id, upkeep_id)` conflict only `execute_gas` and
    /// `check_data` are updated; `positioning_constant` is preserved.
    fn upsert_upkeep(&self, upkeep: &Registration) -> impl Future<Output = Result<()>> + Send;

    fn batch_delete_upkeeps(
        &self,
        registry_id: i64,
        upkeep_ids: &[u64],
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Largest known upkeep id plus one for the registry, or 0 when none are
    /// known yet. The synchronizer only fetches the tail from here upward.
    fn next_upkeep_id(&self, registry: &Registry) -> impl Future<Output = Result<u64>> + Send;

    /// All upkeeps whose turn it is at `block_number`, with their registries.
    fn eligible_upkeeps(
        &self,
        block_number: u64,
    ) -> impl Future<Output = Result<Vec<EligibleUpkeep>>> + Send;
}

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(db_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
            .context("Failed to connect to the DATABASE_URL")?;

        Ok(Self { pool })
    }

    pub async fn apply_migrations(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .context("Failed to apply migrations to the database")
    }
}

#[derive(Debug, FromRow)]
struct RegistryRow {
    id: i64,
    reference_id: Uuid,
    job_id: Uuid,
    address: Vec<u8>,
    from_address: Vec<u8>,
    check_gas: i64,
    block_count_per_turn: i64,
    keeper_index: i64,
    num_keepers: i64,
}

impl TryFrom<RegistryRow> for Registry {
    type Error = anyhow::Error;

    fn try_from(row: RegistryRow) -> Result<Self> {
        Ok(Registry {
            id: row.id,
            reference_id: row.reference_id,
            job_id: row.job_id,
            address: address_from_bytes(&row.address)?,
            from: address_from_bytes(&row.from_address)?,
            check_gas: row.check_gas.try_into().context("check_gas out of range")?,
            block_count_per_turn: row
                .block_count_per_turn
                .try_into()
                .context("block_count_per_turn out of range")?,
            keeper_index: row
                .keeper_index
                .try_into()
                .context("keeper_index out of range")?,
            num_keepers: row
                .num_keepers
                .try_into()
                .context("num_keepers out of range")?,
        })
    }
}

#[derive(Debug, FromRow)]
struct RegistrationRow {
    id: i64,
    registry_id: i64,
    upkeep_id: i64,
    execute_gas: i64,
    check_data: Vec<u8>,
    positioning_constant: i64,
}

impl TryFrom<RegistrationRow> for Registration {
    type Error = anyhow::Error;

    fn try_from(row: RegistrationRow) -> Result<Self> {
        Ok(Registration {
            id: row.id,
            registry_id: row.registry_id,
            upkeep_id: row.upkeep_id.try_into().context("upkeep_id out of range")?,
            execute_gas: row
                .execute_gas
                .try_into()
                .context("execute_gas out of range")?,
            check_data: row.check_data,
            positioning_constant: row
                .positioning_constant
                .try_into()
                .context("positioning_constant out of range")?,
        })
    }
}

fn address_from_bytes(bytes: &[u8]) -> Result<Address> {
    if bytes.len() != Address::len_bytes() {
        bail!(
            "stored address has {} bytes, expected {}",
            bytes.len(),
            Address::len_bytes()
        );
    }
    Ok(Address::from_slice(bytes))
}

const REGISTRY_COLUMNS: &str = "id, reference_id, job_id, address, from_address, check_gas, \
                                block_count_per_turn, keeper_index, num_keepers";

impl KeeperStore for PgStore {
    async fn registries(&self) -> Result<Vec<Registry>> {
        let rows = sqlx::query_as::<_, RegistryRow>(&format!(
            "SELECT {REGISTRY_COLUMNS} FROM keeper_registries ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to query keeper registries")?;

        rows.into_iter().map(Registry::try_from).collect()
    }

    async fn create_registry(&self, registry: &Registry) -> Result<Registry> {
        let row = sqlx::query_as::<_, RegistryRow>(&format!(
            r#"
            INSERT INTO keeper_registries (
                reference_id, job_id, address, from_address,
                check_gas, block_count_per_turn, keeper_index, num_keepers
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (address) DO NOTHING
            RETURNING {REGISTRY_COLUMNS}
            "#
        ))
        .bind(registry.reference_id)
        .bind(registry.job_id)
        .bind(registry.address.as_slice())
        .bind(registry.from.as_slice())
        .bind(registry.check_gas as i64)
        .bind(registry.block_count_per_turn as i64)
        .bind(registry.keeper_index as i64)
        .bind(registry.num_keepers as i64)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to create keeper registry")?
        .ok_or_else(|| anyhow!("registry {} is already registered", registry.address))?;

        row.try_into()
    }

    async fn upsert_registry(&self, registry: &Registry) -> Result<Registry> {
        let row = sqlx::query_as::<_, RegistryRow>(&format!(
            r#"
            INSERT INTO keeper_registries (
                reference_id, job_id, address, from_address,
                check_gas, block_count_per_turn, keeper_index, num_keepers
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (address) DO UPDATE SET
                check_gas = excluded.check_gas,
                block_count_per_turn = excluded.block_count_per_turn,
                keeper_index = excluded.keeper_index,
                num_keepers = excluded.num_keepers
            RETURNING {REGISTRY_COLUMNS}
            "#
        ))
        .bind(registry.reference_id)
        .bind(registry.job_id)
        .bind(registry.address.as_slice())
        .bind(registry.from.as_slice())
        .bind(registry.check_gas as i64)
        .bind(registry.block_count_per_turn as i64)
        .bind(registry.keeper_index as i64)
        .bind(registry.num_keepers as i64)
        .fetch_one(&self.pool)
        .await
        .context("Failed to upsert keeper registry")?;

        row.try_into()
    }

    async fn delete_registry_by_job_id(&self, job_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM keeper_registries WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete keeper registry by job id")?;

        Ok(result.rows_affected())
    }

    async fn upsert_upkeep(&self, upkeep: &Registration) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO keeper_registrations (
                registry_id, upkeep_id, execute_gas, check_data, positioning_constant
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (registry_id, upkeep_id) DO UPDATE SET
                execute_gas = excluded.execute_gas,
                check_data = excluded.check_data
            "#,
        )
        .bind(upkeep.registry_id)
        .bind(i64::try_from(upkeep.upkeep_id).context("upkeep_id out of range")?)
        .bind(upkeep.execute_gas as i64)
        .bind(&upkeep.check_data)
        .bind(upkeep.positioning_constant as i64)
        .execute(&self.pool)
        .await
        .context("Failed to upsert upkeep registration")?;

        Ok(())
    }

    async fn batch_delete_upkeeps(&self, registry_id: i64, upkeep_ids: &[u64]) -> Result<u64> {
        if upkeep_ids.is_empty() {
            return Ok(0);
        }

        let ids = upkeep_ids
            .iter()
            .map(|id| i64::try_from(*id).context("upkeep_id out of range"))
            .collect::<Result<Vec<i64>>>()?;

        let result = sqlx::query(
            "DELETE FROM keeper_registrations WHERE registry_id = $1 AND upkeep_id = ANY($2)",
        )
        .bind(registry_id)
        .bind(&ids)
        .execute(&self.pool)
        .await
        .context("Failed to batch delete upkeep registrations")?;

        Ok(result.rows_affected())
    }

    async fn next_upkeep_id(&self, registry: &Registry) -> Result<u64> {
        let next = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(upkeep_id) + 1, 0) FROM keeper_registrations WHERE registry_id = $1",
        )
        .bind(registry.id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to query next upkeep id")?;

        next.try_into().context("next upkeep id out of range")
    }

    async fn eligible_upkeeps(&self, block_number: u64) -> Result<Vec<EligibleUpkeep>> {
        // One atomic statement; the turn predicate itself runs in
        // Registration::eligible_at so it is shared with every store
        // implementation.
        let rows = sqlx::query(
            r#"
            SELECT
                u.id, u.registry_id, u.upkeep_id, u.execute_gas, u.check_data,
                u.positioning_constant,
                g.id AS r_id, g.reference_id AS r_reference_id, g.job_id AS r_job_id,
                g.address AS r_address, g.from_address AS r_from_address,
                g.check_gas AS r_check_gas,
                g.block_count_per_turn AS r_block_count_per_turn,
                g.keeper_index AS r_keeper_index, g.num_keepers AS r_num_keepers
            FROM keeper_registrations u
            INNER JOIN keeper_registries g ON g.id = u.registry_id
            ORDER BY u.registry_id, u.upkeep_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to query upkeep registrations for eligibility")?;

        let mut eligible = Vec::new();
        for row in rows {
            let upkeep: Registration = RegistrationRow {
                id: row.try_get("id")?,
                registry_id: row.try_get("registry_id")?,
                upkeep_id: row.try_get("upkeep_id")?,
                execute_gas: row.try_get("execute_gas")?,
                check_data: row.try_get("check_data")?,
                positioning_constant: row.try_get("positioning_constant")?,
            }
            .try_into()?;
            let registry: Registry = RegistryRow {
                id: row.try_get("r_id")?,
                reference_id: row.try_get("r_reference_id")?,
                job_id: row.try_get("r_job_id")?,
                address: row.try_get("r_address")?,
                from_address: row.try_get("r_from_address")?,
                check_gas: row.try_get("r_check_gas")?,
                block_count_per_turn: row.try_get("r_block_count_per_turn")?,
                keeper_index: row.try_get("r_keeper_index")?,
                num_keepers: row.try_get("r_num_keepers")?,
            }
            .try_into()?;

            if upkeep.eligible_at(&registry, block_number) {
                eligible.push(EligibleUpkeep { upkeep, registry });
            }
        }

        Ok(eligible)
    }
}
