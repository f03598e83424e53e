//! オフライン署名ワークフロー
//!
//! オンライン機で作成 → オフライン機で署名 → オンライン機で集約・送信、の三段階。
//! 段階ごとに PSBT を一つだけ保持する。読み込みやマージに失敗した場合はどの段階も変更しない。

use bitcoin::Txid;
use bitcoin::psbt::Psbt;

use crate::broadcaster::{Broadcaster, finalize_and_broadcast};
use crate::codec::{self, Format};
use crate::error::AppError;
use crate::finalizer::Finalizer;
use crate::merge::merge;
use crate::signer::{self, SignOptions, SigningCapability};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// 未署名 PSBT の作成
    Create,
    /// オフラインでの署名
    Sign,
    /// 署名済み PSBT の集約と送信
    Assemble,
}

impl Stage {
    pub fn next(self) -> Self {
        match self {
            Stage::Create => Stage::Sign,
            Stage::Sign | Stage::Assemble => Stage::Assemble,
        }
    }

    pub fn prev(self) -> Self {
        match self {
            Stage::Create | Stage::Sign => Stage::Create,
            Stage::Assemble => Stage::Sign,
        }
    }
}

#[derive(Debug)]
pub struct Workflow {
    stage: Stage,
    online: bool,
    created: Option<Psbt>,
    signing: Option<Psbt>,
    assembled: Option<Psbt>,
    did_sign: bool,
}

impl Workflow {
    pub fn new(online: bool) -> Self {
        Workflow { stage: Stage::Create, online, created: None, signing: None, assembled: None, did_sign: false }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn next_stage(&mut self) -> Stage {
        self.stage = self.stage.next();
        self.stage
    }

    pub fn prev_stage(&mut self) -> Stage {
        self.stage = self.stage.prev();
        self.stage
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    /// 署名段階の PSBT にこのワークフローで署名したかどうか
    pub fn did_sign(&self) -> bool {
        self.did_sign
    }

    /// Creator が作った PSBT から始める
    pub fn start(&mut self, psbt: Psbt) {
        self.created = Some(psbt);
        self.stage = Stage::Create;
        log::info!("新しいPSBTでワークフローを開始しました。");
    }

    /// ファイルやクリップボードから読み込んだデータを段階に取り込む。
    ///
    /// 集約段階では、既に読み込んだ PSBT とマージする。
    pub fn load(&mut self, stage: Stage, data: &[u8]) -> Result<(), AppError> {
        let psbt = codec::decode_any(data)?;
        match stage {
            Stage::Create => self.created = Some(psbt),
            Stage::Sign => {
                self.signing = Some(psbt);
                self.did_sign = false;
            }
            Stage::Assemble => {
                let merged = match &self.assembled {
                    Some(existing) => merge(existing, &psbt)?,
                    None => psbt,
                };
                self.assembled = Some(merged);
            }
        }
        self.stage = stage;
        log::info!("{:?} 段階にPSBTを読み込みました。", stage);
        Ok(())
    }

    pub fn psbt(&self, stage: Stage) -> Option<&Psbt> {
        match stage {
            Stage::Create => self.created.as_ref(),
            Stage::Sign => self.signing.as_ref(),
            Stage::Assemble => self.assembled.as_ref(),
        }
    }

    pub fn export(&self, stage: Stage, format: Format) -> Result<Vec<u8>, AppError> {
        let psbt = self
            .psbt(stage)
            .ok_or_else(|| AppError::WorkflowState(format!("{:?} 段階にPSBTがありません", stage)))?;
        Ok(codec::export(psbt, format))
    }

    /// 署名段階の PSBT に署名する。オンライン中は拒否する。
    pub fn sign<S: SigningCapability + ?Sized>(
        &mut self,
        capability: &S,
        options: &SignOptions,
    ) -> Result<bool, AppError> {
        if self.online {
            log::warn!("オンライン中の署名要求を拒否しました。");
            return Err(AppError::WorkflowState("署名はオフラインでのみ行えます".to_string()));
        }
        let psbt = self
            .signing
            .as_mut()
            .ok_or_else(|| AppError::WorkflowState("署名するPSBTが読み込まれていません".to_string()))?;
        let complete = signer::sign(psbt, capability, options)?;
        self.did_sign = true;
        Ok(complete)
    }

    /// 集約した PSBT の署名が揃っているか
    pub fn can_broadcast(&self) -> bool {
        self.assembled
            .as_ref()
            .is_some_and(|psbt| Finalizer::new().is_complete(psbt))
    }

    /// 集約した PSBT を確定して送信する。成功したら集約をリセットし、失敗したら再試行のため残す。
    pub fn broadcast<B: Broadcaster + ?Sized>(&mut self, broadcaster: &B) -> Result<Txid, AppError> {
        if !self.online {
            log::warn!("オフライン中のブロードキャスト要求を拒否しました。");
            return Err(AppError::WorkflowState("ブロードキャストはオンラインでのみ行えます".to_string()));
        }
        let psbt = self
            .assembled
            .as_ref()
            .ok_or_else(|| AppError::WorkflowState("集約されたPSBTがありません".to_string()))?;
        let txid = finalize_and_broadcast(psbt, broadcaster)?;
        self.reset_assembly();
        Ok(txid)
    }

    pub fn reset_assembly(&mut self) {
        self.assembled = None;
    }
}
