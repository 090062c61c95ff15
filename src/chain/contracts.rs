// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Typed contract surfaces. Only the operations the client consumes are
//! declared; the deployed contracts carry more.

use alloy_sol_types::sol;

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    #[derive(Debug)]
    contract Payments {
        error RailInactiveOrSettled(uint256 railId);
        error CannotSettleFutureEpochs(uint256 railId, uint256 untilEpoch, uint256 currentEpoch);

        struct RailView {
            address token;
            address from;
            address to;
            address operator;
            address validator;
            uint256 paymentRate;
            uint256 lockupPeriod;
            uint256 lockupFixed;
            uint256 settledUpTo;
            uint256 endEpoch;
            uint256 commissionRateBps;
            address serviceFeeRecipient;
        }

        struct RailInfo {
            uint256 railId;
            bool isTerminated;
            uint256 endEpoch;
        }

        function accounts(address token, address owner) external view
            returns (uint256 funds, uint256 lockupCurrent, uint256 lockupRate, uint256 lockupLastSettledAt);

        function deposit(address token, address to, uint256 amount) external;

        function depositWithPermit(
            address token,
            address to,
            uint256 amount,
            uint256 deadline,
            uint8 v,
            bytes32 r,
            bytes32 s
        ) external;

        function depositWithPermitAndApproveOperator(
            address token,
            address to,
            uint256 amount,
            uint256 deadline,
            uint8 v,
            bytes32 r,
            bytes32 s,
            address operator,
            uint256 rateAllowance,
            uint256 lockupAllowance,
            uint256 maxLockupPeriod
        ) external;

        function withdraw(address token, uint256 amount) external;

        function setOperatorApproval(
            address token,
            address operator,
            bool approved,
            uint256 rateAllowance,
            uint256 lockupAllowance,
            uint256 maxLockupPeriod
        ) external;

        function operatorApprovals(address token, address owner, address operator) external view
            returns (
                bool isApproved,
                uint256 rateAllowance,
                uint256 rateUsed,
                uint256 lockupAllowance,
                uint256 lockupUsed,
                uint256 maxLockupPeriod
            );

        function settleRail(uint256 railId, uint256 untilEpoch) external payable
            returns (
                uint256 totalSettledAmount,
                uint256 totalNetPayeeAmount,
                uint256 totalOperatorCommission,
                uint256 finalSettledEpoch,
                string note
            );

        function settleTerminatedRailWithoutValidation(uint256 railId) external
            returns (
                uint256 totalSettledAmount,
                uint256 totalNetPayeeAmount,
                uint256 totalOperatorCommission,
                uint256 finalSettledEpoch,
                string note
            );

        function getRail(uint256 railId) external view returns (RailView rail);
        function getRailsForPayerAndToken(address payer, address token) external view returns (RailInfo[] rails);
        function getRailsForPayeeAndToken(address payee, address token) external view returns (RailInfo[] rails);
    }
}

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    #[derive(Debug)]
    contract WarmStorage {
        struct DataSetInfoView {
            uint256 pdpVerifierDataSetId;
            uint256 clientDataSetId;
            uint256 providerId;
            address payer;
            address payee;
            uint256 pdpRailId;
            uint256 cacheMissRailId;
            uint256 cdnRailId;
            uint256 pdpEndEpoch;
            uint256 currentPieceCount;
            uint256 nextPieceId;
            bool isLive;
            bool isManaged;
            string[] metadataKeys;
            string[] metadataValues;
        }

        function getApprovedProviders() external view returns (uint256[] providerIds);
        function getClientDataSets(address payer) external view returns (DataSetInfoView[] dataSets);
        function getDataSet(uint256 dataSetId) external view returns (DataSetInfoView info);
        function getDataSetMetadata(uint256 dataSetId) external view returns (string[] keys, string[] values);
        function getServicePrice() external view
            returns (
                uint256 pricePerTiBPerMonthNoCDN,
                uint256 pricePerTiBPerMonthWithCDN,
                address tokenAddress,
                uint256 epochsPerMonth
            );
        function getMaxProvingPeriod() external view returns (uint64 maxProvingPeriod);
        function challengeWindow() external view returns (uint256 window);
        function clientDataSetIDs(address payer) external view returns (uint256 nextId);
        function sessionKeyRegistry() external view returns (address registry);
    }
}

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    #[derive(Debug)]
    contract ServiceProviderRegistry {
        struct ProviderRecord {
            address serviceProvider;
            address payee;
            string name;
            string description;
            bool active;
        }

        struct PdpOfferingView {
            string serviceURL;
            uint256 minPieceSizeInBytes;
            uint256 maxPieceSizeInBytes;
            bool ipniPiece;
            uint256 storagePricePerTibPerMonth;
            string location;
        }

        function getProviderIdByAddress(address serviceProvider) external view returns (uint256 providerId);
        function getProvider(uint256 providerId) external view returns (ProviderRecord record);
        function getPDPService(uint256 providerId) external view
            returns (PdpOfferingView offering, string[] capabilityKeys, string[] capabilityValues);
    }
}

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    #[derive(Debug)]
    contract PdpVerifier {
        struct PieceData {
            bytes data;
        }

        function getActivePieces(uint256 setId, uint256 offset, uint256 limit) external view
            returns (PieceData[] pieces, uint256[] pieceIds, bool hasMore);
        function getNextPieceId(uint256 setId) external view returns (uint256 nextPieceId);
        function dataSetLive(uint256 setId) external view returns (bool live);
    }
}

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    #[derive(Debug)]
    contract SessionKeyRegistry {
        function authorizationExpiry(address owner, address sessionKey, bytes32 permission) external view
            returns (uint256 expiry);
        function login(address sessionKey, uint256 expiry, bytes32[] permissions, string origin) external;
    }
}

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    #[derive(Debug)]
    contract Erc20 {
        function balanceOf(address owner) external view returns (uint256 balance);
        function allowance(address owner, address spender) external view returns (uint256 remaining);
        function approve(address spender, uint256 amount) external returns (bool ok);
        function name() external view returns (string tokenName);
        function symbol() external view returns (string tokenSymbol);
        function decimals() external view returns (uint8 tokenDecimals);
        function version() external view returns (string tokenVersion);
        function nonces(address owner) external view returns (uint256 nonce);
    }
}

sol! {
    /// EIP-2612 permit message, signed as EIP-712 typed data against the
    /// token's domain.
    #[derive(Debug)]
    struct Permit {
        address owner;
        address spender;
        uint256 value;
        uint256 nonce;
        uint256 deadline;
    }
}
