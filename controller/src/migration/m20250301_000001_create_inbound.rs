use sea_orm_migration::prelude::*;
use sea_orm_migration::schema::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // 创建 inbound 表
        manager
            .create_table(
                Table::create()
                    .table(Inbound::Table)
                    .if_not_exists()
                    .col(big_integer(Inbound::Id).auto_increment().primary_key())
                    .col(string(Inbound::Remark).default(""))
                    .col(boolean(Inbound::Enable).default(true))
                    .col(big_integer(Inbound::Up).default(0))
                    .col(big_integer(Inbound::Down).default(0))
                    .col(big_integer(Inbound::Total).default(0))
                    .col(big_integer(Inbound::ExpiryTime).default(0))
                    .col(string(Inbound::Listen).default(""))
                    .col(integer(Inbound::Port))
                    .col(string(Inbound::Protocol))
                    .col(text(Inbound::Settings))
                    .col(text(Inbound::StreamSettings))
                    .col(string(Inbound::Tag).unique_key())
                    .col(text(Inbound::Sniffing))
                    .col(text(Inbound::Allocate))
                    .to_owned(),
            )
            .await?;

        // 创建 client_traffic 表
        manager
            .create_table(
                Table::create()
                    .table(ClientTraffic::Table)
                    .if_not_exists()
                    .col(big_integer(ClientTraffic::Id).auto_increment().primary_key())
                    .col(big_integer(ClientTraffic::InboundId))
                    .col(boolean(ClientTraffic::Enable).default(true))
                    .col(string(ClientTraffic::Email).unique_key())
                    .col(big_integer(ClientTraffic::Up).default(0))
                    .col(big_integer(ClientTraffic::Down).default(0))
                    .col(big_integer(ClientTraffic::ExpiryTime).default(0))
                    .col(big_integer(ClientTraffic::Total).default(0))
                    .col(integer(ClientTraffic::Reset).default(0))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_client_traffic_inbound")
                            .from(ClientTraffic::Table, ClientTraffic::InboundId)
                            .to(Inbound::Table, Inbound::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_client_traffic_inbound_id")
                    .table(ClientTraffic::Table)
                    .col(ClientTraffic::InboundId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ClientTraffic::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Inbound::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Inbound {
    Table,
    Id,
    Remark,
    Enable,
    Up,
    Down,
    Total,
    ExpiryTime,
    Listen,
    Port,
    Protocol,
    Settings,
    StreamSettings,
    Tag,
    Sniffing,
    Allocate,
}

#[derive(DeriveIden)]
enum ClientTraffic {
    Table,
    Id,
    InboundId,
    Enable,
    Email,
    Up,
    Down,
    ExpiryTime,
    Total,
    Reset,
}
