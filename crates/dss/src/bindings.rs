//! Inline contract interfaces. Parameter types mirror the deployed ABIs
//! exactly (selectors depend on them); return values are declared as
//! `uint256` across the board since every static return decodes from a full
//! word regardless of its declared width.

use alloy::sol;

sol! {
    #[sol(rpc)]
    interface Vat {
        function dai(address usr) external view returns (uint256);
        function sin(address usr) external view returns (uint256);
        function gem(bytes32 ilk, address usr) external view returns (uint256);
        function urns(bytes32 ilk, address usr) external view returns (uint256 ink, uint256 art);
        function ilks(bytes32 ilk) external view returns (uint256 Art, uint256 rate, uint256 spot, uint256 line, uint256 dust);
        function can(address bit, address usr) external view returns (uint256);
        function hope(address usr) external;
    }

    #[sol(rpc)]
    interface Flipper {
        function kicks() external view returns (uint256);
        function beg() external view returns (uint256);
        function ttl() external view returns (uint256);
        function tau() external view returns (uint256);
        function bids(uint256 id) external view returns (uint256 bid, uint256 lot, address guy, uint256 tic, uint256 end, address usr, address gal, uint256 tab);
        function tend(uint256 id, uint256 lot, uint256 bid) external;
        function dent(uint256 id, uint256 lot, uint256 bid) external;
        function deal(uint256 id) external;
        function tick(uint256 id) external;
    }

    #[sol(rpc)]
    interface Flapper {
        function kicks() external view returns (uint256);
        function beg() external view returns (uint256);
        function ttl() external view returns (uint256);
        function tau() external view returns (uint256);
        function live() external view returns (uint256);
        function bids(uint256 id) external view returns (uint256 bid, uint256 lot, address guy, uint256 tic, uint256 end);
        function tend(uint256 id, uint256 lot, uint256 bid) external;
        function deal(uint256 id) external;
        function tick(uint256 id) external;
    }

    #[sol(rpc)]
    interface Flopper {
        function kicks() external view returns (uint256);
        function beg() external view returns (uint256);
        function pad() external view returns (uint256);
        function ttl() external view returns (uint256);
        function tau() external view returns (uint256);
        function live() external view returns (uint256);
        function bids(uint256 id) external view returns (uint256 bid, uint256 lot, address guy, uint256 tic, uint256 end);
        function dent(uint256 id, uint256 lot, uint256 bid) external;
        function deal(uint256 id) external;
        function tick(uint256 id) external;
    }

    #[sol(rpc)]
    interface Clipper {
        function kicks() external view returns (uint256);
        function getStatus(uint256 id) external view returns (bool needsRedo, uint256 price, uint256 lot, uint256 tab);
        function take(uint256 id, uint256 amt, uint256 max, address who, bytes calldata data) external;
        function redo(uint256 id, address kpr) external;
    }

    #[sol(rpc)]
    interface Cat {
        event Bite(bytes32 indexed ilk, address indexed urn, uint256 ink, uint256 art, uint256 tab, address flip, uint256 id);

        function ilks(bytes32 ilk) external view returns (address flip, uint256 chop, uint256 dunk);
        function bite(bytes32 ilk, address urn) external returns (uint256);
    }

    #[sol(rpc)]
    interface Dog {
        event Bark(bytes32 indexed ilk, address indexed urn, uint256 ink, uint256 art, uint256 due, address clip, uint256 id);

        function ilks(bytes32 ilk) external view returns (address clip, uint256 chop, uint256 hole, uint256 dirt);
        function Hole() external view returns (uint256);
        function Dirt() external view returns (uint256);
        function bark(bytes32 ilk, address urn, address kpr) external returns (uint256);
    }

    #[sol(rpc)]
    interface Vow {
        function Sin() external view returns (uint256);
        function Ash() external view returns (uint256);
        function bump() external view returns (uint256);
        function hump() external view returns (uint256);
        function sump() external view returns (uint256);
        function wait() external view returns (uint256);
        function sin(uint256 era) external view returns (uint256);
        function heal(uint256 rad) external;
        function flog(uint256 era) external;
        function flap() external returns (uint256);
        function flop() external returns (uint256);
    }

    #[sol(rpc)]
    interface Join {
        function dec() external view returns (uint256);
        function join(address usr, uint256 amt) external;
        function exit(address usr, uint256 amt) external;
    }

    #[sol(rpc)]
    interface Token {
        function balanceOf(address usr) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
    }
}

pub use {
    Cat::CatInstance, Clipper::ClipperInstance, Dog::DogInstance, Flapper::FlapperInstance,
    Flipper::FlipperInstance, Flopper::FlopperInstance, Join::JoinInstance, Token::TokenInstance,
    Vat::VatInstance, Vow::VowInstance,
};
